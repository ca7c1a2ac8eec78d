//! RRSIG generation over attached rrsets, RSASHA256 via `ring`.
//!
//! The signed data is assembled by hand: the RRSIG rdata minus the signature
//! followed by the rrset in canonical form (RFC 4034 section 3.1.8.1), with
//! owner names lowercased and the records ordered by rdata.

use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use domain::base::name::Name;
use domain::base::rdata::ComposeRecordData;
use domain::base::{Rtype, ToName};
use ring::rand::SystemRandom;
use ring::signature::{RsaKeyPair, RSA_PKCS1_SHA256};

use crate::cache::{rr, Record};
use crate::error::Result;

const ALGORITHM_RSASHA256: u8 = 8;

pub struct Signer {
    signer_name: String,
    signer_wire: Vec<u8>,
    key_tag: u16,
    key_pair: RsaKeyPair,
    rng: SystemRandom,
}

impl Signer {
    /// Loads the DNSKEY zone line and the base64 PKCS#8 private key from
    /// disk.
    pub fn from_files(public_path: &str, private_path: &str) -> Result<Signer> {
        let dnskey = std::fs::read_to_string(public_path)?;
        let private = std::fs::read_to_string(private_path)?;
        Self::from_parts(&dnskey, &private)
    }

    pub fn from_parts(dnskey_line: &str, private_base64: &str) -> Result<Signer> {
        let (owner, rdata) = parse_dnskey_line(dnskey_line)?;
        let key_tag = key_tag(&rdata);

        let der = base64::engine::general_purpose::STANDARD
            .decode(private_base64.split_whitespace().collect::<String>())?;
        let key_pair = RsaKeyPair::from_pkcs8(&der)?;

        let signer_name = owner.to_ascii_lowercase();
        let name = Name::<Vec<u8>>::from_str(&signer_name)?;
        let mut signer_wire = Vec::new();
        name.compose(&mut signer_wire).unwrap();

        Ok(Signer {
            signer_name,
            signer_wire,
            key_tag,
            key_pair,
            rng: SystemRandom::new(),
        })
    }

    pub fn key_tag(&self) -> u16 {
        self.key_tag
    }

    /// Appends one RRSIG per `(owner, type)` group of the given records.
    /// A group that fails to sign is passed through unsigned.
    pub fn sign_records(&self, records: Vec<Record>) -> Vec<Record> {
        let mut groups: Vec<(String, Rtype, Vec<Record>)> = Vec::new();
        for record in &records {
            let key = record.fqdn().to_ascii_lowercase();
            match groups
                .iter_mut()
                .find(|(owner, rtype, _)| *owner == key && *rtype == record.rtype)
            {
                Some((_, _, group)) => group.push(record.clone()),
                None => groups.push((key, record.rtype, vec![record.clone()])),
            }
        }

        let mut signed = records;
        for (_, _, group) in groups {
            match self.sign_group(&group) {
                Ok(rrsig) => signed.push(rrsig),
                Err(e) => {
                    log::error!(target: "dnssec", "failed to sign {} {} rrset: {}",
                        group[0].fqdn(), group[0].rtype, e);
                }
            }
        }
        signed
    }

    fn sign_group(&self, group: &[Record]) -> Result<Record> {
        let first = &group[0];
        let owner_fqdn = first.fqdn().to_ascii_lowercase();
        let owner = Name::<Vec<u8>>::from_str(&owner_fqdn)?;
        let rtype = first.rtype;
        let orig_ttl = first.ttl;
        let labels = label_count(&owner_fqdn);

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        // Sign a little into the past so clock skew and daylight saving
        // cannot invalidate fresh signatures, and a week into the future.
        let inception = (now - 3 * 3600) as u32;
        let expiration = (now + 7 * 24 * 3600) as u32;

        let mut data = Vec::new();
        data.extend_from_slice(&rtype.to_int().to_be_bytes());
        data.push(ALGORITHM_RSASHA256);
        data.push(labels);
        data.extend_from_slice(&orig_ttl.to_be_bytes());
        data.extend_from_slice(&expiration.to_be_bytes());
        data.extend_from_slice(&inception.to_be_bytes());
        data.extend_from_slice(&self.key_tag.to_be_bytes());
        data.extend_from_slice(&self.signer_wire);

        let mut owner_wire = Vec::new();
        owner.compose(&mut owner_wire).unwrap();

        let mut rdatas = Vec::new();
        for record in group {
            let mut canonical = record.clone();
            canonical.normalize();
            canonical.ttl = orig_ttl;
            let scanned = rr::scan_record(&rr::record_to_line(&canonical))?;
            let mut rdata = Vec::new();
            scanned.data().compose_canonical_rdata(&mut rdata).unwrap();
            rdatas.push(rdata);
        }
        rdatas.sort();

        for rdata in rdatas {
            data.extend_from_slice(&owner_wire);
            data.extend_from_slice(&rtype.to_int().to_be_bytes());
            data.extend_from_slice(&1u16.to_be_bytes()); // class IN
            data.extend_from_slice(&orig_ttl.to_be_bytes());
            data.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
            data.extend_from_slice(&rdata);
        }

        let mut signature = vec![0u8; self.key_pair.public().modulus_len()];
        self.key_pair
            .sign(&RSA_PKCS1_SHA256, &self.rng, &data, &mut signature)?;

        let target = format!(
            "{} {} {} {} {} {} {} {} {}",
            rtype,
            ALGORITHM_RSASHA256,
            labels,
            orig_ttl,
            sig_time(expiration),
            sig_time(inception),
            self.key_tag,
            self.signer_name,
            base64::engine::general_purpose::STANDARD.encode(&signature),
        );

        Ok(Record {
            name: first.name.clone(),
            domain: first.domain.clone(),
            rtype: Rtype::RRSIG,
            target,
            ttl: orig_ttl,
            online: true,
            local: first.local,
            ..Default::default()
        })
    }
}

/// Parses a DNSKEY zone line into its owner and rdata wire form.
fn parse_dnskey_line(line: &str) -> Result<(String, Vec<u8>)> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let at = fields
        .iter()
        .position(|f| f.eq_ignore_ascii_case("DNSKEY"))
        .ok_or_else(|| error!(Dnssec => "no DNSKEY record in {:?}", line))?;
    if at + 4 > fields.len() || at == 0 {
        return Err(error!(Dnssec => "malformed DNSKEY record in {:?}", line));
    }

    let owner = rr::to_fqdn(fields[0]);
    let flags: u16 = fields[at + 1]
        .parse()
        .map_err(|_| error!(Dnssec => "bad DNSKEY flags in {:?}", line))?;
    let protocol: u8 = fields[at + 2]
        .parse()
        .map_err(|_| error!(Dnssec => "bad DNSKEY protocol in {:?}", line))?;
    let algorithm: u8 = fields[at + 3]
        .parse()
        .map_err(|_| error!(Dnssec => "bad DNSKEY algorithm in {:?}", line))?;
    let key = base64::engine::general_purpose::STANDARD
        .decode(fields[at + 4..].concat())?;

    let mut rdata = Vec::new();
    rdata.extend_from_slice(&flags.to_be_bytes());
    rdata.push(protocol);
    rdata.push(algorithm);
    rdata.extend_from_slice(&key);
    Ok((owner, rdata))
}

/// RFC 4034 appendix B key tag over the DNSKEY rdata.
fn key_tag(rdata: &[u8]) -> u16 {
    let mut ac: u32 = 0;
    for (i, byte) in rdata.iter().enumerate() {
        ac += if i & 1 == 1 {
            u32::from(*byte)
        } else {
            u32::from(*byte) << 8
        };
    }
    ac += (ac >> 16) & 0xffff;
    (ac & 0xffff) as u16
}

/// Label count for the RRSIG labels field; the root and a leading wildcard
/// do not count.
fn label_count(fqdn: &str) -> u8 {
    fqdn.split('.')
        .filter(|label| !label.is_empty() && *label != "*")
        .count() as u8
}

/// YYYYMMDDHHmmSS in UTC, the zone-text form of RRSIG timestamps.
fn sig_time(unix: u32) -> String {
    let unix = i64::from(unix);
    let days = unix.div_euclid(86400);
    let secs = unix.rem_euclid(86400);
    let (year, month, day) = civil_from_days(days);
    format!(
        "{:04}{:02}{:02}{:02}{:02}{:02}",
        year,
        month,
        day,
        secs / 3600,
        (secs % 3600) / 60,
        secs % 60
    )
}

fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719468;
    let era = z.div_euclid(146097);
    let doe = z.rem_euclid(146097);
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_tag_of_known_rdata() {
        // 256 3 8 with a tiny fake key; the tag is just the checksum.
        let mut rdata = Vec::new();
        rdata.extend_from_slice(&256u16.to_be_bytes());
        rdata.push(3);
        rdata.push(8);
        rdata.extend_from_slice(&[0x01, 0x02, 0x03, 0x04]);
        let ac = (0x01u32 << 8)
            + 0x00
            + (0x03u32 << 8)
            + 0x08
            + (0x01u32 << 8)
            + 0x02
            + (0x03u32 << 8)
            + 0x04;
        assert_eq!(key_tag(&rdata), (ac & 0xffff) as u16);
    }

    #[test]
    fn dnskey_line_parses_with_and_without_class() {
        let (owner, rdata) =
            parse_dnskey_line("example.com. 3600 IN DNSKEY 256 3 8 AQID").unwrap();
        assert_eq!(owner, "example.com.");
        assert_eq!(&rdata[..4], &[0x01, 0x00, 3, 8]);
        assert_eq!(&rdata[4..], &[0x01, 0x02, 0x03]);

        let (owner, _) = parse_dnskey_line("example.com. DNSKEY 257 3 8 AQID").unwrap();
        assert_eq!(owner, "example.com.");

        assert!(parse_dnskey_line("example.com. 3600 IN A 1.2.3.4").is_err());
    }

    #[test]
    fn sig_time_formats_utc() {
        assert_eq!(sig_time(0), "19700101000000");
        assert_eq!(sig_time(86399), "19700101235959");
        assert_eq!(sig_time(86400), "19700102000000");
        // 2011-02-01 04:25:05 UTC
        assert_eq!(sig_time(1296534305), "20110201042505");
    }

    #[test]
    fn label_counting() {
        assert_eq!(label_count("www.example.com."), 3);
        assert_eq!(label_count("example.com."), 2);
        assert_eq!(label_count("."), 0);
        assert_eq!(label_count("*.example.com."), 2);
    }
}
