//! Iterative resolver for names we are not authoritative for. Walks down
//! from the root hints, imports every upstream reply into its own record
//! store and answers later queries from there until the TTLs run out.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use domain::base::iana::Rcode;
use domain::base::Rtype;
use futures::future::BoxFuture;

use crate::cache::{rr, Record, RecordStore, Status};
use crate::config::ForwarderConfig;
use crate::message::Reply;

mod resolve;
mod roothints;

pub struct Forwarder {
    pub store: RecordStore,
    settings: ForwarderConfig,
}

impl Forwarder {
    /// Creates the forwarder with the compiled-in root hints loaded.
    pub fn new(settings: ForwarderConfig) -> Arc<Forwarder> {
        let forwarder = Arc::new(Forwarder {
            store: RecordStore::new(),
            settings,
        });
        forwarder.parse_root_hints(roothints::ROOT_HINTS);
        forwarder
    }

    /// Starts the background refresh of the root hints.
    pub fn start(self: &Arc<Self>) {
        let forwarder = self.clone();
        tokio::spawn(async move { forwarder.root_hints_loop().await });
    }

    pub fn domain_exists(&self, domain: &str) -> bool {
        self.store.domain_exists(domain)
    }

    pub fn records_json(&self) -> String {
        self.store.records_json()
    }

    /// Answers one question, resolving iteratively when the store cannot.
    /// The store is probed on a scratch reply first so a failed walk leaves
    /// no partial sections behind.
    pub async fn serve_request(
        &self,
        reply: &mut Reply,
        host: &str,
        domain: &str,
        qtype: Rtype,
        client: IpAddr,
    ) {
        let mut probe = reply.clone();
        if self.get_recursive(&mut probe, 0, domain, qtype, host, client, true) == Status::Found {
            *reply = probe;
            return;
        }

        // Walk the hierarchy and import whatever comes back; errors only
        // matter insofar as the store still cannot answer afterwards.
        let (_, status) = self.get_recursive_forward(0, domain, qtype, host).await;
        if status != Status::Found {
            log::debug!(target: "forwarder", "iterative walk for {} {} failed: {:?}",
                domain, qtype, status);
        }

        let mut probe = reply.clone();
        if self.get_recursive(&mut probe, 0, domain, qtype, host, client, true) == Status::Found {
            *reply = probe;
            return;
        }
        reply.rcode = Rcode::NXDOMAIN;
    }

    /// The iterative walk. Looks the name up in the store; on a miss it
    /// locates the nameservers of the parent domain (recursively, bottoming
    /// out at the root hints), fans out to them and imports the reply. A
    /// few query types get post-processing: CNAMEs in address answers are
    /// chased, and NS answers without glue get their addresses looked up.
    pub fn get_recursive_forward<'a>(
        &'a self,
        level: u32,
        domain: &'a str,
        qtype: Rtype,
        host: &'a str,
    ) -> BoxFuture<'a, (Vec<Record>, Status)> {
        Box::pin(async move {
            if level > self.settings.max_recursion {
                return (Vec::new(), Status::ErrMaxRecursion);
            }
            let unspecified = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

            let (mut records, status) = self.store.get(domain, qtype, host, unspecified, true);
            if status != Status::Found {
                let parent = if host.is_empty() {
                    rr::parent_domain(domain)
                } else {
                    domain.to_string()
                };
                let (ns, status) = self
                    .get_recursive_forward(level + 1, &parent, Rtype::NS, "")
                    .await;
                if status != Status::Found {
                    return (Vec::new(), status);
                }

                // TODO: query over IPv6 transport when no A target exists.
                let ns_addrs: Vec<String> = ns
                    .iter()
                    .filter(|r| r.rtype == Rtype::A)
                    .map(|r| r.target.clone())
                    .collect();
                if ns_addrs.is_empty() {
                    return (Vec::new(), Status::ErrNotFound);
                }

                let (resolved, status) = self.resolve(&ns_addrs, host, domain, qtype).await;
                if status != Status::Found {
                    return (Vec::new(), Status::ErrNotFound);
                }
                records = resolved;
            }

            match qtype {
                Rtype::A | Rtype::AAAA => {
                    let targets: Vec<String> = records
                        .iter()
                        .filter(|r| r.rtype == Rtype::CNAME)
                        .map(|r| r.target.clone())
                        .collect();
                    for target in targets {
                        let (host, domain) = rr::split_domain(&target);
                        let (chained, status) = self
                            .get_recursive_forward(level + 1, &domain, Rtype::A, &host)
                            .await;
                        if status != Status::Found {
                            return (records, status);
                        }
                        records.extend(chained);
                    }
                }
                Rtype::NS => {
                    let targets: Vec<String> = records
                        .iter()
                        .filter(|r| r.rtype == Rtype::NS)
                        .map(|r| r.target.clone())
                        .collect();
                    for target in targets {
                        if matching_address(&records, Rtype::A, &target)
                            || matching_address(&records, Rtype::AAAA, &target)
                        {
                            continue;
                        }
                        let (host, domain) = rr::split_domain(&target);
                        let (glue, status) = self
                            .get_recursive_forward(level + 1, &domain, Rtype::A, &host)
                            .await;
                        if status == Status::Found {
                            records.extend(
                                glue.into_iter()
                                    .filter(|r| r.name == host && r.domain == domain),
                            );
                        }
                    }
                }
                _ => {}
            }
            (records, Status::Found)
        })
    }

    /// Fills the reply from the forwarder's own store, chasing aliases and
    /// attaching glue the same way the authoritative side does.
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
                reply.append(level, records);
                Status::Found
            }
            Rtype::CNAME => {
                let (records, status) = self.store.get(domain, qtype, host, client, honor_ttl);
                if status != Status::Found {
                    return Status::ErrNotFound;
                }
                let targets: Vec<String> = records.iter().map(|r| r.target.clone()).collect();
                reply.append(level, records);
                for target in targets {
                    let (host, domain) = rr::split_domain(&target);
                    self.get_recursive(reply, level, &domain, Rtype::A, &host, client, honor_ttl);
                }
                Status::Found
            }
            Rtype::NS | Rtype::MX => {
                let (records, status) = self.store.get(domain, qtype, host, client, honor_ttl);
                let targets: Vec<String> = records
                    .iter()
                    .filter_map(|r| r.target.split_whitespace().last().map(String::from))
                    .collect();
                reply.append(level, records);
                for target in targets {
                    let (host, domain) = rr::split_domain(&target);
                    self.get_recursive(reply, 1, &domain, Rtype::A, &host, client, honor_ttl);
                }
                status
            }
            _ => {
                let (records, status) = self.store.get(domain, qtype, host, client, honor_ttl);
                if status == Status::Found {
                    reply.append(level, records);
                }
                status
            }
        }
    }
}

fn matching_address(records: &[Record], qtype: Rtype, target: &str) -> bool {
    records
        .iter()
        .any(|r| r.rtype == qtype && r.fqdn() == target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Question;

    fn client() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    fn empty_reply(qname: &str, qtype: Rtype) -> Reply {
        Reply {
            questions: vec![Question {
                qname: qname.into(),
                qtype,
            }],
            answer: Vec::new(),
            authority: Vec::new(),
            additional: Vec::new(),
            rcode: Rcode::NOERROR,
            authoritative: false,
            recursion_available: false,
            authenticated_data: false,
            truncated: false,
            edns: None,
        }
    }

    fn forwarder() -> Arc<Forwarder> {
        Forwarder::new(ForwarderConfig::default())
    }

    #[test]
    fn starts_with_root_hints_loaded() {
        let forwarder = forwarder();
        assert!(forwarder.domain_exists("."));
        assert!(forwarder.domain_exists("root-servers.net."));

        let (records, status) = forwarder.store.get(".", Rtype::NS, "", client(), false);
        assert_eq!(status, Status::Found);
        assert_eq!(records.len(), 13);
    }

    #[test]
    fn cached_answers_are_served_without_network() {
        let forwarder = forwarder();
        forwarder.store.import_zone("www.nu.nl. 300 IN A 94.100.1.1\n");

        let mut reply = empty_reply("www.nu.nl.", Rtype::A);
        let status =
            forwarder.get_recursive(&mut reply, 0, "nu.nl.", Rtype::A, "www", client(), true);
        assert_eq!(status, Status::Found);
        assert_eq!(reply.answer.len(), 1);
        assert!(reply.recursion_available);
    }

    #[test]
    fn cname_chain_from_the_store() {
        let forwarder = forwarder();
        forwarder
            .store
            .import_zone("www.nu.nl. 300 IN CNAME site.nu.nl.\nsite.nu.nl. 300 IN A 94.100.1.2\n");

        let mut reply = empty_reply("www.nu.nl.", Rtype::A);
        let status =
            forwarder.get_recursive(&mut reply, 0, "nu.nl.", Rtype::A, "www", client(), true);
        assert_eq!(status, Status::Found);
        assert_eq!(reply.answer.len(), 2);
        assert_eq!(reply.answer[0].rtype, Rtype::CNAME);
        assert_eq!(reply.answer[1].rtype, Rtype::A);
    }

    #[tokio::test]
    async fn recursion_depth_is_bounded() {
        let forwarder = forwarder();
        let (_, status) = forwarder
            .get_recursive_forward(21, "example.com.", Rtype::A, "www")
            .await;
        assert_eq!(status, Status::ErrMaxRecursion);
    }

    #[tokio::test]
    async fn hinted_ns_lookup_stays_local() {
        // The root NS set plus its glue is fully in the store, so the walk
        // must not hit the network.
        let forwarder = forwarder();
        let (records, status) = forwarder.get_recursive_forward(0, ".", Rtype::NS, "").await;
        assert_eq!(status, Status::Found);
        let ns = records.iter().filter(|r| r.rtype == Rtype::NS).count();
        let glue = records.iter().filter(|r| r.rtype == Rtype::A).count();
        assert_eq!(ns, 13);
        assert_eq!(glue, 13);
    }
}
