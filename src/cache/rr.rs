//! Conversions between zone text, wire records and [`Record`] values. Name
//! surgery helpers live here too since both sides need them.

use std::fmt;

use bytes::Bytes;
use domain::base::{Message, ParsedName, Rtype};
use domain::rdata::{AllRecordData, ZoneRecordData};
use domain::zonefile::inplace::{Entry, ScannedRecord, Zonefile};

use crate::error::Result;

use super::Record;

/// Formats a name with a guaranteed trailing dot. The `domain` crate displays
/// names in common display format, without one.
pub fn to_fqdn<N: fmt::Display>(name: N) -> String {
    let s = name.to_string();
    if s.is_empty() {
        ".".to_string()
    } else if s.ends_with('.') {
        s
    } else {
        format!("{}.", s)
    }
}

/// Splits a FQDN into its leftmost label and the remainder.
pub fn split_domain(fqdn: &str) -> (String, String) {
    match fqdn.split_once('.') {
        Some((host, domain)) if !domain.is_empty() => (host.to_string(), domain.to_string()),
        Some((host, _)) => (host.to_string(), ".".to_string()),
        None => (fqdn.to_string(), ".".to_string()),
    }
}

/// Drops the leftmost label of a FQDN.
pub fn parent_domain(fqdn: &str) -> String {
    split_domain(fqdn).1
}

/// Parses one zone-text line into a scanned record.
pub fn scan_record(line: &str) -> Result<ScannedRecord> {
    let mut zonefile = Zonefile::new();
    zonefile.extend_from_slice(line.as_bytes());
    zonefile.extend_from_slice(b"\n");
    match zonefile.next_entry()? {
        Some(Entry::Record(record)) => Ok(record),
        _ => Err(error!(Zonefile => "no record in line {:?}", line)),
    }
}

/// Parses BIND-style zone text. Unparseable lines are skipped so one bad
/// record cannot sink the rest of the zone.
pub fn parse_zone_text(zone: &str) -> Vec<Record> {
    let mut records = Vec::new();
    for line in zone.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with(';') {
            continue;
        }
        match scan_record(line) {
            Ok(scanned) => records.push(scanned_to_record(&scanned)),
            Err(e) => {
                log::debug!(target: "cache", "skipping zone line {:?}: {}", line, e);
            }
        }
    }
    records
}

fn scanned_to_record(scanned: &ScannedRecord) -> Record {
    let owner = to_fqdn(scanned.owner());
    let rtype = scanned.rtype();
    let target = zone_rdata_text(scanned.data());
    let ttl = scanned.ttl().as_secs();

    // Domain-level types keep the whole owner as the domain; anything else
    // splits off the leftmost label as the host name.
    let (name, domain) = match rtype {
        Rtype::SOA | Rtype::NS | Rtype::TXT | Rtype::MX => (String::new(), owner),
        _ => split_domain(&owner),
    };

    Record {
        name,
        domain,
        rtype,
        target,
        ttl,
        ..Default::default()
    }
}

/// One zone-text line for a record, the exact shape `import_zone` consumes.
pub fn record_to_line(record: &Record) -> String {
    format!(
        "{} {} IN {} {}",
        record.fqdn(),
        record.ttl,
        record.rtype,
        record.target
    )
}

pub fn records_to_zone(records: &[Record]) -> String {
    let mut zone = String::new();
    for record in records {
        zone.push_str(&record_to_line(record));
        zone.push('\n');
    }
    zone
}

/// Reorders a transfer set so the SOA comes first and is repeated last.
pub fn encapsulate_soa(mut records: Vec<Record>) -> Vec<Record> {
    if let Some(id) = records.iter().position(|r| r.rtype == Rtype::SOA) {
        records.swap(0, id);
        records.push(records[0].clone());
    }
    records
}

/// Renders rdata in zone-text form. Name-bearing types are rebuilt with
/// absolute names since the plain `Display` output drops trailing dots,
/// which would turn round-tripped targets into relative names.
pub fn zone_rdata_text<O, N>(data: &ZoneRecordData<O, N>) -> String
where
    O: AsRef<[u8]>,
    N: fmt::Display,
    ZoneRecordData<O, N>: fmt::Display,
{
    match data {
        ZoneRecordData::Cname(cname) => to_fqdn(cname.cname()),
        ZoneRecordData::Dname(dname) => to_fqdn(dname.dname()),
        ZoneRecordData::Ns(ns) => to_fqdn(ns.nsdname()),
        ZoneRecordData::Ptr(ptr) => to_fqdn(ptr.ptrdname()),
        ZoneRecordData::Mx(mx) => format!("{} {}", mx.preference(), to_fqdn(mx.exchange())),
        ZoneRecordData::Srv(srv) => format!(
            "{} {} {} {}",
            srv.priority(),
            srv.weight(),
            srv.port(),
            to_fqdn(srv.target())
        ),
        ZoneRecordData::Soa(soa) => format!(
            "{} {} {} {} {} {} {}",
            to_fqdn(soa.mname()),
            to_fqdn(soa.rname()),
            soa.serial(),
            soa.refresh().as_secs(),
            soa.retry().as_secs(),
            soa.expire().as_secs(),
            soa.minimum().as_secs()
        ),
        other => other.to_string(),
    }
}

/// Same as [`zone_rdata_text`] for records parsed off the wire. Returns
/// `None` for the pseudo types that have no place in zone text.
pub fn wire_rdata_text<O, N>(data: &AllRecordData<O, N>) -> Option<String>
where
    O: AsRef<[u8]>,
    N: fmt::Display,
    AllRecordData<O, N>: fmt::Display,
{
    match data {
        AllRecordData::Opt(_) => None,
        AllRecordData::Cname(cname) => Some(to_fqdn(cname.cname())),
        AllRecordData::Dname(dname) => Some(to_fqdn(dname.dname())),
        AllRecordData::Ns(ns) => Some(to_fqdn(ns.nsdname())),
        AllRecordData::Ptr(ptr) => Some(to_fqdn(ptr.ptrdname())),
        AllRecordData::Mx(mx) => Some(format!("{} {}", mx.preference(), to_fqdn(mx.exchange()))),
        AllRecordData::Srv(srv) => Some(format!(
            "{} {} {} {}",
            srv.priority(),
            srv.weight(),
            srv.port(),
            to_fqdn(srv.target())
        )),
        AllRecordData::Soa(soa) => Some(format!(
            "{} {} {} {} {} {} {}",
            to_fqdn(soa.mname()),
            to_fqdn(soa.rname()),
            soa.serial(),
            soa.refresh().as_secs(),
            soa.retry().as_secs(),
            soa.expire().as_secs(),
            soa.minimum().as_secs()
        )),
        other => Some(other.to_string()),
    }
}

/// Renders every record of a reply message as zone text, ready for
/// `import_zone`. Referral data in the authority and additional sections is
/// kept; OPT and TSIG pseudo records are not.
pub fn message_to_zone(msg: &Message<Bytes>) -> String {
    let mut zone = String::new();
    let sections = [msg.answer(), msg.authority(), msg.additional()];
    for section in sections.into_iter().flatten() {
        for record in section.limit_to::<AllRecordData<Bytes, ParsedName<Bytes>>>() {
            let Ok(record) = record else {
                continue;
            };
            if record.rtype() == Rtype::TSIG {
                continue;
            }
            if let Some(rdata) = wire_rdata_text(record.data()) {
                zone.push_str(&format!(
                    "{} {} IN {} {}\n",
                    to_fqdn(record.owner()),
                    record.ttl().as_secs(),
                    record.rtype(),
                    rdata
                ));
            }
        }
    }
    zone
}
