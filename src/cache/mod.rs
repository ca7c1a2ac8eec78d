//! The record store: a three-level map `domain -> query type -> owner name ->
//! records`, shared by the authoritative master and the forwarder (each owns
//! its own instance).

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{OnceLock, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use domain::base::Rtype;
use ipnet::IpNet;
use ring::digest;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

pub mod balancer;
pub mod rr;

/// Status codes threaded through the core. They do not map one-to-one to DNS
/// rcodes; the dispatcher does that translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Found,
    ErrNotAuthorized,
    ErrNotFound,
    ErrMaxRecursion,
    ErrBalanceFailure,
    ErrNSNotFound,
    ErrTimeout,
}

/// Collectable counters for a single record. Updated with atomics so the
/// store's write lock is never needed for bookkeeping.
#[derive(Debug, Default)]
pub struct Statistics {
    pub requests: AtomicI64,
    pub connected: AtomicI64,
    pub tx: AtomicI64,
    pub rx: AtomicI64,
}

impl Statistics {
    pub fn new(requests: i64, connected: i64, tx: i64, rx: i64) -> Self {
        Statistics {
            requests: AtomicI64::new(requests),
            connected: AtomicI64::new(connected),
            tx: AtomicI64::new(tx),
            rx: AtomicI64::new(rx),
        }
    }

    pub fn requests(&self) -> i64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn connected(&self) -> i64 {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn traffic(&self) -> i64 {
        self.rx.load(Ordering::Relaxed) + self.tx.load(Ordering::Relaxed)
    }
}

impl Clone for Statistics {
    fn clone(&self) -> Self {
        Statistics::new(
            self.requests.load(Ordering::Relaxed),
            self.connected.load(Ordering::Relaxed),
            self.tx.load(Ordering::Relaxed),
            self.rx.load(Ordering::Relaxed),
        )
    }
}

impl Serialize for Statistics {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("Statistics", 4)?;
        s.serialize_field("requests", &self.requests.load(Ordering::Relaxed))?;
        s.serialize_field("connected", &self.connected.load(Ordering::Relaxed))?;
        s.serialize_field("tx", &self.tx.load(Ordering::Relaxed))?;
        s.serialize_field("rx", &self.rx.load(Ordering::Relaxed))?;
        s.end()
    }
}

/// A single resource-record-like value.
#[derive(Debug, Clone, Serialize)]
pub struct Record {
    /// Owner label; empty means the zone apex.
    pub name: String,
    /// Zone the record belongs to, dot-terminated.
    pub domain: String,
    #[serde(rename = "type", serialize_with = "ser_rtype")]
    pub rtype: Rtype,
    /// Rdata as text. For SOA it may contain `###SERIAL###` style tokens.
    pub target: String,
    pub ttl: u32,
    /// Monitoring metadata: record is part of an active/passive setup.
    pub active_passive: String,
    /// Monitoring metadata: nodes that should serve this record.
    pub cluster_nodes: u32,
    /// Monitoring metadata: cluster node this record belongs to.
    pub cluster_id: String,
    /// Comma-separated balancer modes applied on reads.
    pub balance_mode: String,
    /// Used by the topology balancer.
    pub local_networks: Vec<IpNet>,
    /// Used by the preference balancer.
    pub preference: i32,
    pub statistics: Statistics,
    /// Offline records are invisible to queriers.
    pub online: bool,
    /// True if the record is served by this node's own data plane.
    pub local: bool,
    #[serde(skip)]
    pub(crate) uuid: OnceLock<String>,
    #[serde(skip)]
    pub(crate) ttl_expire: SystemTime,
}

fn ser_rtype<S: Serializer>(rtype: &Rtype, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(rtype)
}

impl Default for Record {
    fn default() -> Self {
        Record {
            name: String::new(),
            domain: String::new(),
            rtype: Rtype::A,
            target: String::new(),
            ttl: 0,
            active_passive: String::new(),
            cluster_nodes: 0,
            cluster_id: String::new(),
            balance_mode: String::new(),
            local_networks: Vec::new(),
            preference: 0,
            statistics: Statistics::default(),
            online: false,
            local: false,
            uuid: OnceLock::new(),
            ttl_expire: UNIX_EPOCH,
        }
    }
}

impl Record {
    /// Returns the memoised identity digest, computing it on first use.
    ///
    /// Statistics, online state and the TTL deadline do not participate, so
    /// two records describing the same data compare equal regardless of what
    /// the counters have seen.
    pub fn uuid(&self) -> &str {
        self.uuid.get_or_init(|| {
            let mut networks: Vec<String> = self
                .local_networks
                .iter()
                .map(|n| format!("{}:{}", n.addr(), n.netmask()))
                .collect();
            networks.sort();
            let identity = format!(
                "{}{}{}{}{}{}{}{}{}{}{}{}",
                self.name,
                self.domain,
                self.rtype,
                self.target,
                self.ttl,
                self.active_passive,
                self.cluster_nodes,
                self.cluster_id,
                self.balance_mode,
                self.preference,
                self.local,
                networks.join(""),
            );
            hex::encode(digest::digest(&digest::SHA256, identity.as_bytes()))
        })
    }

    /// The full owner name of the record.
    pub fn fqdn(&self) -> String {
        if self.name.is_empty() {
            self.domain.clone()
        } else {
            format!("{}.{}", self.name, self.domain)
        }
    }

    pub(crate) fn normalize(&mut self) {
        self.name.make_ascii_lowercase();
        self.domain.make_ascii_lowercase();
    }

    /// A copy normalised the way [`RecordStore::add`] stores records, so
    /// identity matching sees the same digest input. The memoised digest is
    /// dropped since normalisation may change identity fields.
    fn keyed(&self) -> Record {
        let mut record = self.clone();
        record.normalize();
        if record.ttl == 0 {
            record.ttl = 10;
        }
        record.uuid = OnceLock::new();
        record
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.uuid() == other.uuid()
    }
}

impl Eq for Record {}

type HostRecords = HashMap<String, Vec<Record>>;
type TypeRecords = HashMap<Rtype, HostRecords>;

/// The three-level record cache. All mutation goes through the single
/// readers-writer lock; reads take the shared side and operate on copies.
#[derive(Debug, Default)]
pub struct RecordStore {
    domains: RwLock<HashMap<String, TypeRecords>>,
}

impl RecordStore {
    pub fn new() -> Self {
        Default::default()
    }

    /// Normalises case, stamps the TTL deadline and appends the record to its
    /// `(domain, type, name)` bucket. No dedup happens at this layer.
    pub fn add(&self, domain: &str, mut record: Record) {
        record.normalize();
        record.domain = domain.to_ascii_lowercase();
        if record.ttl == 0 {
            record.ttl = 10;
        }
        record.ttl_expire = SystemTime::now() + Duration::from_secs(u64::from(record.ttl));
        // Prime the identity digest over the normalised fields so reply
        // copies with rewritten case can never observe a different one.
        record.uuid = OnceLock::new();
        record.uuid();

        let mut domains = self.domains.write().unwrap();
        domains
            .entry(record.domain.clone())
            .or_default()
            .entry(record.rtype)
            .or_default()
            .entry(record.name.clone())
            .or_default()
            .push(record);
    }

    /// Removes the bucket entry whose identity matches `record`. Empty
    /// buckets are pruned.
    pub fn remove(&self, domain: &str, record: &Record) {
        let search_domain = domain.to_ascii_lowercase();
        let record = record.keyed();

        let mut domains = self.domains.write().unwrap();
        let Some(hosts) = domains
            .get_mut(&search_domain)
            .and_then(|types| types.get_mut(&record.rtype))
        else {
            return;
        };
        let Some(bucket) = hosts.get_mut(&record.name) else {
            return;
        };
        if let Some(id) = bucket.iter().position(|old| old.uuid() == record.uuid()) {
            bucket.swap_remove(id);
            if bucket.is_empty() {
                hosts.remove(&record.name);
            }
        }
    }

    /// Identity match within the record's own bucket.
    pub fn exists(&self, record: &Record) -> bool {
        let record = record.keyed();
        let domains = self.domains.read().unwrap();
        domains
            .get(&record.domain)
            .and_then(|types| types.get(&record.rtype))
            .and_then(|hosts| hosts.get(&record.name))
            .map(|bucket| bucket.iter().any(|old| old.uuid() == record.uuid()))
            .unwrap_or(false)
    }

    /// Removes the first entry of the record's bucket that shares its owner
    /// and carries `query_type`, regardless of target. Used for the
    /// root-server singleton rule.
    pub fn remove_by_kind(&self, domain: &str, record: &Record, query_type: Rtype) {
        let search_domain = domain.to_ascii_lowercase();
        let record = record.keyed();

        let mut domains = self.domains.write().unwrap();
        let Some(hosts) = domains
            .get_mut(&search_domain)
            .and_then(|types| types.get_mut(&record.rtype))
        else {
            return;
        };
        let Some(bucket) = hosts.get_mut(&record.name) else {
            return;
        };
        if let Some(id) = bucket.iter().position(|old| {
            old.domain == record.domain && old.name == record.name && old.rtype == query_type
        }) {
            bucket.swap_remove(id);
            if bucket.is_empty() {
                hosts.remove(&record.name);
            }
        }
    }

    /// Companion check for [`RecordStore::remove_by_kind`].
    pub fn exists_by_kind(&self, record: &Record, query_type: Rtype) -> bool {
        let record = record.keyed();
        let domains = self.domains.read().unwrap();
        domains
            .get(&record.domain)
            .and_then(|types| types.get(&record.rtype))
            .and_then(|hosts| hosts.get(&record.name))
            .map(|bucket| {
                bucket.iter().any(|old| {
                    old.domain == record.domain
                        && old.name == record.name
                        && old.rtype == query_type
                })
            })
            .unwrap_or(false)
    }

    /// The authoritative read path.
    ///
    /// Returns copies of the live records in the `(domain, type, name)`
    /// bucket, with the query's exact case echoed into owner and domain and,
    /// when `honor_ttl` is set, the TTL rewritten to the remaining seconds.
    /// The copies are balanced outside the lock when a balance mode is set.
    pub fn get(
        &self,
        domain_name: &str,
        query_type: Rtype,
        host_name: &str,
        client: IpAddr,
        honor_ttl: bool,
    ) -> (Vec<Record>, Status) {
        let search_domain = domain_name.to_ascii_lowercase();
        let search_host = host_name.to_ascii_lowercase();

        let mut records = Vec::new();
        let mut balance_mode = String::new();
        {
            let domains = self.domains.read().unwrap();
            let Some(bucket) = domains
                .get(&search_domain)
                .and_then(|types| types.get(&query_type))
                .and_then(|hosts| hosts.get(&search_host))
            else {
                return (records, Status::ErrNotFound);
            };

            let now = SystemTime::now();
            for record in bucket {
                let mut record = record.clone();
                if record.rtype == Rtype::SOA {
                    record.target = template_tokens(&record.target);
                }
                if !record.online {
                    continue;
                }
                if honor_ttl && record.ttl_expire <= now {
                    continue;
                }
                // Echo the 0x20 case of the query into the reply copy; the
                // stored record stays lowercased.
                record.domain = domain_name.to_string();
                record.name = host_name.to_string();
                if honor_ttl {
                    record.ttl = record
                        .ttl_expire
                        .duration_since(now)
                        .map(|d| d.as_secs() as u32)
                        .unwrap_or(0);
                }
                if !record.balance_mode.is_empty() {
                    balance_mode = record.balance_mode.clone();
                }
                records.push(record);
            }
        }

        if records.is_empty() {
            return (records, Status::ErrNotFound);
        }
        if !balance_mode.is_empty() && balancer::multi_sort(&mut records, client, &balance_mode).is_err()
        {
            return (records, Status::ErrBalanceFailure);
        }
        (records, Status::Found)
    }

    /// Every live record of the domain, across all types and owner names.
    pub fn get_domain(
        &self,
        domain_name: &str,
        _client: IpAddr,
        honor_ttl: bool,
    ) -> (Vec<Record>, Status) {
        let search_domain = domain_name.to_ascii_lowercase();
        let mut records = Vec::new();

        let domains = self.domains.read().unwrap();
        if let Some(types) = domains.get(&search_domain) {
            let now = SystemTime::now();
            for hosts in types.values() {
                for bucket in hosts.values() {
                    for record in bucket {
                        if !record.online {
                            continue;
                        }
                        if honor_ttl && record.ttl_expire <= now {
                            continue;
                        }
                        let mut record = record.clone();
                        if record.rtype == Rtype::SOA {
                            record.target = template_tokens(&record.target);
                        }
                        records.push(record);
                    }
                }
            }
        }

        if records.is_empty() {
            return (records, Status::ErrNotFound);
        }
        (records, Status::Found)
    }

    /// Presence of the domain key, i.e. do we serve requests in this domain.
    pub fn domain_exists(&self, domain: &str) -> bool {
        let domains = self.domains.read().unwrap();
        domains.contains_key(&domain.to_ascii_lowercase())
    }

    /// Parses BIND-style zone text and merges every parseable record into the
    /// store. An existing identical record is re-added to refresh its TTL;
    /// `root-servers.net.` address records are singletons per owner name.
    pub fn import_zone(&self, zone: &str) -> Vec<Record> {
        let mut records = Vec::new();
        for mut record in rr::parse_zone_text(zone) {
            record.normalize();

            if self.exists(&record) {
                self.remove(&record.domain.clone(), &record);
            }

            // Only the root servers get their address records replaced
            // regardless of target, so there is only ever one A and one AAAA
            // per root server name.
            if record.domain == "root-servers.net."
                && (record.rtype == Rtype::A || record.rtype == Rtype::AAAA)
                && self.exists_by_kind(&record, record.rtype)
            {
                self.remove_by_kind(&record.domain.clone(), &record, record.rtype);
            }

            record.online = true;
            self.add(&record.domain.clone(), record.clone());
            records.push(record);
        }
        records
    }

    /// Bumps the request counter of the record with the given identity.
    /// Takes the shared lock only; the counter add is atomic.
    pub fn stats_add_request_count(&self, uuid: &str) {
        let domains = self.domains.read().unwrap();
        for types in domains.values() {
            for hosts in types.values() {
                for bucket in hosts.values() {
                    for record in bucket {
                        if record.uuid() == uuid {
                            record.statistics.requests.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            }
        }
    }

    /// Serialises the whole store. The maps are re-keyed through `BTreeMap`
    /// so the output is stable.
    pub fn records_json(&self) -> String {
        let domains = self.domains.read().unwrap();
        let snapshot: BTreeMap<&str, BTreeMap<String, BTreeMap<&str, &Vec<Record>>>> = domains
            .iter()
            .map(|(domain, types)| {
                (
                    domain.as_str(),
                    types
                        .iter()
                        .map(|(rtype, hosts)| {
                            (
                                rtype.to_string(),
                                hosts
                                    .iter()
                                    .map(|(name, bucket)| (name.as_str(), bucket))
                                    .collect(),
                            )
                        })
                        .collect(),
                )
            })
            .collect();
        serde_json::to_string(&snapshot).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Replaces `###SERIAL###` with the current Unix time rounded down to the
/// nearest multiple of ten. Unknown `###TOKEN###` tokens are left intact.
fn template_tokens(target: &str) -> String {
    let mut out = String::with_capacity(target.len());
    let mut rest = target;
    while let Some(start) = rest.find("###") {
        let after = &rest[start + 3..];
        match after.find("###") {
            Some(end) => {
                let token = &after[..end];
                out.push_str(&rest[..start]);
                if token == "SERIAL" {
                    let now = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .map(|d| d.as_secs())
                        .unwrap_or(0);
                    out.push_str(&(now - now % 10).to_string());
                } else {
                    out.push_str(&rest[start..start + 6 + end]);
                }
                rest = &after[end + 3..];
            }
            None => break,
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn client() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    fn a_record(name: &str, target: &str) -> Record {
        Record {
            name: name.into(),
            rtype: Rtype::A,
            target: target.into(),
            cluster_id: "localhost1".into(),
            online: true,
            ..Default::default()
        }
    }

    #[test]
    fn add_and_get_echoes_query_case() {
        let store = RecordStore::new();
        store.add("example.com.", a_record("www", "1.2.3.4"));

        let (records, status) = store.get("ExAmple.CoM.", Rtype::A, "Www", client(), true);
        assert_eq!(status, Status::Found);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "Www");
        assert_eq!(records[0].domain, "ExAmple.CoM.");
        assert_eq!(records[0].target, "1.2.3.4");

        // The stored record is untouched by the case echo.
        let (records, _) = store.get("example.com.", Rtype::A, "www", client(), true);
        assert_eq!(records[0].name, "www");
    }

    #[test]
    fn offline_records_are_invisible() {
        let store = RecordStore::new();
        let mut record = a_record("www", "1.2.3.4");
        record.online = false;
        store.add("example.com.", record);

        let (records, status) = store.get("example.com.", Rtype::A, "www", client(), true);
        assert!(records.is_empty());
        assert_eq!(status, Status::ErrNotFound);
    }

    #[test]
    fn returned_ttl_is_remaining_and_bounded() {
        let store = RecordStore::new();
        let mut record = a_record("www", "1.2.3.4");
        record.ttl = 300;
        store.add("example.com.", record);

        let (records, _) = store.get("example.com.", Rtype::A, "www", client(), true);
        assert!(records[0].ttl <= 300);

        // Without TTL enforcement the original TTL is exposed.
        let (records, _) = store.get("example.com.", Rtype::A, "www", client(), false);
        assert_eq!(records[0].ttl, 300);
    }

    #[test]
    fn zero_ttl_defaults_to_ten() {
        let store = RecordStore::new();
        store.add("example.com.", a_record("www", "1.2.3.4"));
        let (records, _) = store.get("example.com.", Rtype::A, "www", client(), false);
        assert_eq!(records[0].ttl, 10);
    }

    #[test]
    fn uuid_ignores_statistics_and_online_state() {
        let online = Record {
            name: "www".into(),
            domain: "example.com.".into(),
            rtype: Rtype::A,
            target: "1.2.3.4".into(),
            online: true,
            statistics: Statistics::new(10, 2, 300, 400),
            ..Default::default()
        };
        let offline = Record {
            name: "www".into(),
            domain: "example.com.".into(),
            rtype: Rtype::A,
            target: "1.2.3.4".into(),
            online: false,
            ..Default::default()
        };
        assert_eq!(online.uuid(), offline.uuid());

        let other_target = Record {
            target: "1.2.3.5".into(),
            ..offline.clone()
        };
        // The clone carried the memoised digest; rebuild instead.
        let other_target = Record {
            uuid: OnceLock::new(),
            ..other_target
        };
        assert_ne!(online.uuid(), other_target.uuid());
    }

    #[test]
    fn add_then_remove_restores_prior_state() {
        let store = RecordStore::new();
        store.add("example.com.", a_record("www", "1.2.3.4"));
        store.add("example.com.", a_record("www", "1.2.3.5"));

        let record = a_record("www", "1.2.3.5");
        let mut keyed = record.clone();
        keyed.domain = "example.com.".into();
        keyed.ttl = 10;
        assert!(store.exists(&keyed));

        store.remove("example.com.", &keyed);
        assert!(!store.exists(&keyed));
        let (records, _) = store.get("example.com.", Rtype::A, "www", client(), true);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].target, "1.2.3.4");
    }

    #[test]
    fn soa_serial_templating() {
        let store = RecordStore::new();
        let record = Record {
            name: "".into(),
            rtype: Rtype::SOA,
            target: "ns1.example.com. hostmaster.example.com. ###SERIAL### 3600 10 30 30".into(),
            online: true,
            ..Default::default()
        };
        store.add("example.com.", record);

        let before = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let (records, status) = store.get("example.com.", Rtype::SOA, "", client(), false);
        assert_eq!(status, Status::Found);
        let serial: i64 = records[0].target.split_whitespace().nth(2).unwrap().parse().unwrap();
        assert_eq!(serial % 10, 0);
        assert!((before as i64 - serial).abs() < 20);
    }

    #[test]
    fn unknown_tokens_are_left_intact() {
        assert_eq!(template_tokens("###OTHER### x"), "###OTHER### x");
        assert!(template_tokens("###SERIAL###").parse::<u64>().is_ok());
    }

    #[test]
    fn domain_exists_is_case_insensitive() {
        let store = RecordStore::new();
        store.add("Example.COM.", a_record("www", "1.2.3.4"));
        assert!(store.domain_exists("example.com."));
        assert!(store.domain_exists("EXAMPLE.com."));
        assert!(!store.domain_exists("example.org."));
    }

    #[test]
    fn get_domain_returns_all_live_records() {
        let store = RecordStore::new();
        store.add("example.com.", a_record("www", "1.2.3.4"));
        store.add("example.com.", a_record("mail", "1.2.3.5"));
        let mut offline = a_record("ftp", "1.2.3.6");
        offline.online = false;
        store.add("example.com.", offline);

        let (records, status) = store.get_domain("example.com.", client(), false);
        assert_eq!(status, Status::Found);
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn import_zone_refreshes_and_applies_singleton_rule() {
        let store = RecordStore::new();
        let zone = "a.root-servers.net. 3600000 IN A 198.41.0.4\n";
        store.import_zone(zone);
        let zone = "a.root-servers.net. 3600000 IN A 198.41.0.5\n";
        store.import_zone(zone);

        let (records, _) = store.get("root-servers.net.", Rtype::A, "a", client(), false);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].target, "198.41.0.5");

        // Outside the root servers, differing targets accumulate.
        store.import_zone("www.example.com. 60 IN A 1.2.3.4\n");
        store.import_zone("www.example.com. 60 IN A 1.2.3.5\n");
        let (records, _) = store.get("example.com.", Rtype::A, "www", client(), false);
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn import_zone_roundtrip() {
        let store = RecordStore::new();
        store.add("example.com.", a_record("www", "1.2.3.4"));
        let (records, _) = store.get("example.com.", Rtype::A, "www", client(), false);
        let zone = rr::records_to_zone(&records);

        let copy = RecordStore::new();
        copy.import_zone(&zone);
        let (records, status) = copy.get("example.com.", Rtype::A, "www", client(), false);
        assert_eq!(status, Status::Found);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].target, "1.2.3.4");
    }
}
