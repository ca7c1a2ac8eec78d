//! Authoritative responder: answers from its own record store, attaches the
//! zone's NS set and glue, and signs attached rrsets when a key is
//! configured.

use std::net::IpAddr;

use domain::base::Rtype;

use crate::cache::{rr, Record, RecordStore, Status};
use crate::config::MasterConfig;
use crate::error::Result;
use crate::message::Reply;

pub mod dnssec;

pub struct Master {
    pub store: RecordStore,
    signer: Option<dnssec::Signer>,
}

impl Default for Master {
    fn default() -> Self {
        Master::new()
    }
}

impl Master {
    pub fn new() -> Master {
        Master {
            store: RecordStore::new(),
            signer: None,
        }
    }

    pub fn from_config(config: &MasterConfig) -> Result<Master> {
        let signer = match (&config.dnssec_public_key, &config.dnssec_private_key) {
            (Some(public), Some(private)) => {
                let signer = dnssec::Signer::from_files(public, private)?;
                log::info!(target: "master", "dnssec signing enabled, key tag {}", signer.key_tag());
                Some(signer)
            }
            (None, None) => None,
            _ => {
                return Err(
                    error!(Dnssec => "dnssec signing needs both the public and the private key"),
                )
            }
        };
        Ok(Master {
            store: RecordStore::new(),
            signer,
        })
    }

    pub fn add_record(&self, domain: &str, record: Record) {
        self.store.add(domain, record);
    }

    pub fn remove_record(&self, domain: &str, record: &Record) {
        self.store.remove(domain, record);
    }

    pub fn domain_exists(&self, domain: &str) -> bool {
        self.store.domain_exists(domain)
    }

    pub fn records_json(&self) -> String {
        self.store.records_json()
    }

    /// Fills `reply` for one question we are authoritative for. The NS set of
    /// the domain is attached to the authority section unless the question
    /// asked for it already; finding it is what makes the reply
    /// authoritative. The OPT buffer size is recorded for the writer.
    pub fn serve_request(
        &self,
        reply: &mut Reply,
        host: &str,
        domain: &str,
        qtype: Rtype,
        client: IpAddr,
        bufsize: u16,
    ) -> Status {
        let status = self.get_recursive(reply, 0, domain, qtype, host, client, false);

        if qtype != Rtype::NS
            && self.get_recursive(reply, -1, domain, Rtype::NS, "", client, false) == Status::Found
        {
            reply.authoritative = true;
        }

        reply.edns = Some(bufsize);
        status
    }

    /// Reads one query type from the store into the section selected by
    /// `level` and chases the records other records point at: CNAME targets,
    /// NS and MX names get their addresses attached as glue.
    fn get_recursive(
        &self,
        reply: &mut Reply,
        level: i32,
        domain: &str,
        qtype: Rtype,
        host: &str,
        client: IpAddr,
        honor_ttl: bool,
    ) -> Status {
        match qtype {
            Rtype::A | Rtype::AAAA => {
                let (mut records, _) = self.store.get(domain, Rtype::A, host, client, honor_ttl);
                let (records6, _) = self.store.get(domain, Rtype::AAAA, host, client, honor_ttl);
                records.extend(records6);
                if records.is_empty() {
                    // No address record; the name may still be an alias.
                    return self.get_recursive(
                        reply,
                        level,
                        domain,
                        Rtype::CNAME,
                        host,
                        client,
                        honor_ttl,
                    );
                }
                reply.recursion_available = true;
                self.store.stats_add_request_count(records[0].uuid());
                self.attach(reply, level, records);
                Status::Found
            }
            Rtype::CNAME => {
                let (records, status) = self.store.get(domain, qtype, host, client, honor_ttl);
                if status != Status::Found {
                    return Status::ErrNotFound;
                }
                let targets: Vec<String> = records.iter().map(|r| r.target.clone()).collect();
                self.attach(reply, level, records);
                for target in targets {
                    let (host, domain) = rr::split_domain(&target);
                    self.get_recursive(reply, level, &domain, Rtype::A, &host, client, honor_ttl);
                }
                Status::Found
            }
            Rtype::NS => {
                let (records, status) = self.store.get(domain, qtype, host, client, honor_ttl);
                let targets: Vec<String> = records.iter().map(|r| r.target.clone()).collect();
                self.attach(reply, level, records);
                for target in targets {
                    let (host, domain) = rr::split_domain(&target);
                    self.get_recursive(reply, 1, &domain, Rtype::A, &host, client, honor_ttl);
                }
                status
            }
            Rtype::MX => {
                let (records, status) = self.store.get(domain, qtype, host, client, honor_ttl);
                let exchanges: Vec<String> = records
                    .iter()
                    .filter_map(|r| r.target.split_whitespace().last().map(String::from))
                    .collect();
                self.attach(reply, level, records);
                for exchange in exchanges {
                    let (host, domain) = rr::split_domain(&exchange);
                    self.get_recursive(reply, 1, &domain, Rtype::A, &host, client, honor_ttl);
                }
                status
            }
            // Transfers are streamed by the dispatcher, not answered here.
            Rtype::AXFR => Status::Found,
            _ => {
                let (records, status) = self.store.get(domain, qtype, host, client, honor_ttl);
                if status == Status::Found {
                    self.attach(reply, level, records);
                }
                status
            }
        }
    }

    fn attach(&self, reply: &mut Reply, level: i32, records: Vec<Record>) {
        if records.is_empty() {
            return;
        }
        let records = match &self.signer {
            Some(signer) => {
                reply.authenticated_data = true;
                signer.sign_records(records)
            }
            None => records,
        };
        reply.append(level, records);
    }
}
