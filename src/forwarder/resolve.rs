//! Parallel fan-out of one question to a set of upstream nameservers. The
//! first reply wins; everything the winner said is imported into the store.

use std::str::FromStr;
use std::time::Duration;

use bytes::Bytes;
use domain::base::{Message, MessageBuilder, Name, Rtype};
use rand::seq::SliceRandom;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::cache::{rr, Record, Status};
use crate::error::Result;

use super::Forwarder;

const EDNS_BUFSIZE: u16 = 4096;

impl Forwarder {
    /// Queries up to `max_nameservers` of the given addresses concurrently
    /// and imports the first reply that arrives within the round's timeout.
    pub(crate) async fn resolve(
        &self,
        nameservers: &[String],
        host: &str,
        domain: &str,
        qtype: Rtype,
    ) -> (Vec<Record>, Status) {
        if nameservers.is_empty() {
            return (Vec::new(), Status::ErrNSNotFound);
        }
        let question = if host.is_empty() {
            domain.to_string()
        } else {
            format!("{}.{}", host, domain)
        };

        let mut nameservers = nameservers.to_vec();
        if nameservers.len() > self.settings.max_nameservers {
            nameservers.shuffle(&mut rand::thread_rng());
            nameservers.truncate(self.settings.max_nameservers);
        }

        // Capacity one: the first reply is consumed, late ones are dropped
        // by the non-blocking send.
        let (tx, mut rx) = mpsc::channel::<Message<Bytes>>(1);
        for nameserver in &nameservers {
            let addr = format!("{}:53", nameserver);
            let question = question.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                match query_single(&addr, &question, qtype).await {
                    Ok(reply) => {
                        let _ = tx.try_send(reply);
                    }
                    Err(e) => {
                        log::debug!(target: "forwarder", "query to {} for {} failed: {}",
                            addr, question, e);
                    }
                }
            });
        }
        drop(tx);

        let timeout = Duration::from_secs(self.settings.query_timeout);
        let reply = match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(reply)) => reply,
            _ => {
                log::debug!(target: "forwarder", "no reply for {} {} within {:?}",
                    question, qtype, timeout);
                return (Vec::new(), Status::ErrTimeout);
            }
        };

        let records = self.store.import_zone(&rr::message_to_zone(&reply));
        log::debug!(target: "forwarder", "imported {} records for {} {}",
            records.len(), question, qtype);
        (records, Status::Found)
    }
}

/// One EDNS0 query to one server over UDP.
async fn query_single(addr: &str, question: &str, qtype: Rtype) -> Result<Message<Bytes>> {
    let qname = Name::<Vec<u8>>::from_str(question)?;
    let id: u16 = rand::random();

    let mut builder = MessageBuilder::new_vec();
    builder.header_mut().set_id(id);
    builder.header_mut().set_rd(false);
    let mut question = builder.question();
    question
        .push((&qname, qtype))
        .map_err(|_| error!(PushRecord))?;
    let mut additional = question.additional();
    additional
        .opt(|opt| {
            opt.set_udp_payload_size(EDNS_BUFSIZE);
            opt.set_dnssec_ok(true);
            Ok(())
        })
        .map_err(|_| error!(PushRecord))?;
    let query = additional.finish();

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(addr).await?;
    socket.send(&query).await?;

    let mut buf = vec![0u8; usize::from(EDNS_BUFSIZE)];
    let len = socket.recv(&mut buf).await?;
    buf.truncate(len);

    let reply = Message::from_octets(Bytes::from(buf))
        .map_err(|_| error!(Io => "short reply from {}", addr))?;
    if reply.header().id() != id {
        return Err(error!(Io => "mismatched reply id from {}", addr));
    }
    Ok(reply)
}
