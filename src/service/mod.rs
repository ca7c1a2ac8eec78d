//! The dispatcher: implements the server [`Service`] contract, decides per
//! question whether the master, the forwarder or a refusal answers it,
//! applies the limiter on both sides of that decision and fits the reply to
//! the transport before it reaches the writer. AXFR runs out of band as a
//! transaction stream.

use core::future::{ready, Future};

use std::pin::Pin;
use std::sync::Arc;

use domain::base::iana::{Opcode, Rcode};
use domain::base::message_builder::AdditionalBuilder;
use domain::base::{Message, Rtype};
use domain::net::server::message::Request;
use domain::net::server::service::CallResult;
use domain::net::server::service::{Service, ServiceError, ServiceResult};
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::stream::{empty, once, Stream};
use octseq::OctetsBuilder;

use crate::cache::{rr, Status};
use crate::config::Config;
use crate::forwarder::Forwarder;
use crate::limiter::{Limiter, LimiterStatus};
use crate::master::Master;
use crate::message::Reply;

use self::handler::{HandleDns, HandlerResult};

mod handler;
pub mod middleware;

#[derive(Clone)]
pub struct Dnslb {
    pub config: Arc<Config>,
    pub master: Arc<Master>,
    pub forwarder: Arc<Forwarder>,
    pub limiter: Arc<Limiter>,
}

impl Service<Vec<u8>> for Dnslb {
    type Target = Vec<u8>;
    type Stream = Pin<Box<dyn Stream<Item = ServiceResult<Self::Target>> + Send>>;
    type Future = Pin<Box<dyn Future<Output = Self::Stream> + Send>>;

    fn call(&self, request: Request<Vec<u8>>) -> Self::Future {
        let dnslb = self.clone();

        Box::pin(async move {
            if !matches!(
                request
                    .message()
                    .sole_question()
                    .map(|q| q.qtype() == Rtype::AXFR),
                Ok(true)
            ) {
                return match dnslb.handle_non_axfr(request).await {
                    Ok(Some(call_result)) => {
                        Box::pin(once(ready(Ok(call_result)))) as Self::Stream
                    }
                    Ok(None) => Box::pin(empty()) as Self::Stream,
                    Err(e) => Box::pin(once(ready(Err(e)))) as Self::Stream,
                };
            }

            let (sender, receiver) = unbounded();

            if let Err(e) = dnslb.handle_axfr(request, sender.clone()) {
                let _ = sender.unbounded_send(Err(e));
            }

            Box::pin(receiver) as Self::Stream
        })
    }
}

impl HandleDns for Dnslb {
    async fn handle_non_axfr(
        &self,
        request: Request<Vec<u8>>,
    ) -> HandlerResult<Option<CallResult<Vec<u8>>>> {
        let msg = request.message().clone();
        let tcp = !request.transport_ctx().is_udp();
        let bufsize = reply_bufsize(&msg, tcp);
        let client = request.client_addr().ip();

        let mut reply = Reply::from_request(&msg);

        if msg.header().opcode() == Opcode::QUERY {
            match self.limiter.lookup(client, &mut reply) {
                LimiterStatus::RateLimited => {
                    log::debug!(target: "limiter", "rate limited {}; dropping request", client);
                    return Ok(None);
                }
                LimiterStatus::Cached => {
                    log::debug!(target: "limiter", "cached reply for {}", client);
                }
                LimiterStatus::Miss => self.answer_questions(&mut reply, client, bufsize).await,
            }
        }

        let (builder, shrunk) = reply
            .fit(&msg, usize::from(bufsize), tcp)
            .map_err(|_| ServiceError::InternalError)?;
        if shrunk {
            log::debug!(target: "server", "reply to {} shrunk to fit {} bytes", client, bufsize);
        }
        Ok(Some(CallResult::new(builder)))
    }

    fn handle_axfr(
        &self,
        request: Request<Vec<u8>>,
        sender: UnboundedSender<HandlerResult<CallResult<Vec<u8>>>>,
    ) -> HandlerResult<()> {
        let msg = request.message().clone();
        let client = request.client_addr().ip();
        let question = msg
            .sole_question()
            .map_err(|_| ServiceError::InternalError)?;
        let qname = rr::to_fqdn(question.qname());

        // Transfers only run over a stream transport, for permitted peers,
        // for zones we actually serve.
        if request.transport_ctx().is_udp()
            || !self.config.xfer_allowed(client)
            || !self.master.domain_exists(&qname)
        {
            log::info!(target: "axfr", "refusing transfer of {} to {}", qname, client);
            let mut refused = Reply::from_request(&msg);
            refused.rcode = rcode_for(Status::ErrNotAuthorized);
            let builder = refused
                .build(&msg, 0, false)
                .map_err(|_| ServiceError::InternalError)?;
            let _ = sender.unbounded_send(Ok(CallResult::new(builder)));
            return Ok(());
        }

        let (records, status) = self.master.store.get_domain(&qname, client, false);
        if status != Status::Found {
            let mut failed = Reply::from_request(&msg);
            failed.rcode = Rcode::SERVFAIL;
            let builder = failed
                .build(&msg, 0, false)
                .map_err(|_| ServiceError::InternalError)?;
            let _ = sender.unbounded_send(Ok(CallResult::new(builder)));
            return Ok(());
        }

        // One envelope holding the whole zone, SOA first and repeated last.
        let records = rr::encapsulate_soa(records);
        let count = records.len();
        let mut reply = Reply::from_request(&msg);
        reply.answer = records;

        let mut builder = reply
            .build(&msg, count, false)
            .map_err(|_| ServiceError::InternalError)?;
        set_axfr_header(&msg, &mut builder);
        let _ = sender.unbounded_send(Ok(CallResult::new(builder)));
        log::info!(target: "axfr", "transferred {} ({} records) to {}", qname, count, client);
        Ok(())
    }
}

impl Dnslb {
    /// The per-question walk: exact domain, parent domain, forwarding,
    /// refusal.
    async fn answer_questions(&self, reply: &mut Reply, client: std::net::IpAddr, bufsize: u16) {
        let questions = reply.questions.clone();
        for question in &questions {
            if !question.qname.ends_with('.') || question.qname == "." {
                reply.rcode = Rcode::NOTAUTH;
                continue;
            }
            if !self.config.request_allowed(question.qtype) {
                log::info!(target: "server", "refusing query type {} from {}",
                    question.qtype, client);
                reply.rcode = Rcode::REFUSED;
                continue;
            }

            if self.master.domain_exists(&question.qname) {
                // A domain-level request for a zone we serve.
                let status = self.master.serve_request(
                    reply,
                    "",
                    &question.qname,
                    question.qtype,
                    client,
                    bufsize,
                );
                match status {
                    Status::Found => self.limiter.store(client, reply),
                    status => reply.rcode = rcode_for(status),
                }
            } else if self
                .master
                .domain_exists(&rr::parent_domain(&question.qname))
            {
                // A host record inside a zone we serve.
                let (host, domain) = rr::split_domain(&question.qname);
                let status =
                    self.master
                        .serve_request(reply, &host, &domain, question.qtype, client, bufsize);
                reply.authoritative = true;
                match status {
                    Status::Found => self.limiter.store(client, reply),
                    status => reply.rcode = rcode_for(status),
                }
            } else if self.config.forwarding_allowed(client) {
                // Not ours, but the client may recurse through us. Domain
                // level types query the name as a whole.
                let (host, domain) = match question.qtype {
                    Rtype::SOA | Rtype::NS | Rtype::TXT | Rtype::MX => {
                        (String::new(), question.qname.clone())
                    }
                    _ => rr::split_domain(&question.qname),
                };
                self.forwarder
                    .serve_request(reply, &host, &domain, question.qtype, client)
                    .await;
                // Forwarded answers are cached by the forwarder's own store,
                // not the limiter.
                continue;
            } else {
                log::info!(target: "server", "refusing query for {} from {}",
                    question.qname, client);
                reply.rcode = Rcode::REFUSED;
            }
        }
    }
}

fn rcode_for(status: Status) -> Rcode {
    match status {
        Status::Found => Rcode::NOERROR,
        Status::ErrNotAuthorized => Rcode::REFUSED,
        Status::ErrBalanceFailure => Rcode::SERVFAIL,
        Status::ErrNotFound
        | Status::ErrMaxRecursion
        | Status::ErrNSNotFound
        | Status::ErrTimeout => Rcode::NXDOMAIN,
    }
}

/// The effective reply buffer: EDNS0 clamped to at least 512 bytes on UDP,
/// the protocol maximum less one on a stream transport.
fn reply_bufsize(msg: &Message<Vec<u8>>, tcp: bool) -> u16 {
    if tcp {
        return u16::MAX - 1;
    }
    match msg.opt() {
        Some(opt) => opt.udp_payload_size().max(512),
        None => 512,
    }
}

fn set_axfr_header<Target>(msg: &Message<Vec<u8>>, additional: &mut AdditionalBuilder<Target>)
where
    Target: AsMut<[u8]> + OctetsBuilder,
{
    // RFC 5936 section 2.2.1 header values for AXFR responses.
    let header = additional.header_mut();
    header.set_id(msg.header().id());
    header.set_qr(true);
    header.set_opcode(Opcode::QUERY);
    header.set_aa(true);
    header.set_tc(false);
    header.set_rd(msg.header().rd());
    header.set_ra(false);
    header.set_z(false);
    header.set_ad(false);
    header.set_cd(false);
}
