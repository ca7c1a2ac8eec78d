use std::net::IpAddr;

use domain::base::Rtype;
use ipnet::IpNet;
use serde::Deserialize;

use crate::error::Result;

pub const BASE_CONFIG_FILE: &str = "/etc/dnslb/config.yml";

/// Server settings, immutable after start. The limiter thresholds are the
/// only values hot-swapped later, under the limiter's own lock.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listen `host:port` for both UDP and TCP.
    pub addr: String,
    /// TSIG secret for zone transfers, key name `axfr.`.
    pub axfer_password: String,
    /// Query types answered at all. An empty list allows everything.
    pub allowed_requests: Vec<String>,
    /// Networks permitted to AXFR.
    pub allowed_xfer: Vec<IpNet>,
    /// Networks permitted to use recursion.
    pub allowed_forwarding: Vec<IpNet>,
    pub master: MasterConfig,
    pub forwarder: ForwarderConfig,
    pub limiter: LimiterConfig,
    pub log: LogConfig,
}

impl Config {
    pub fn xfer_allowed(&self, client: IpAddr) -> bool {
        ip_allowed(&self.allowed_xfer, client)
    }

    pub fn forwarding_allowed(&self, client: IpAddr) -> bool {
        ip_allowed(&self.allowed_forwarding, client)
    }

    pub fn request_allowed(&self, qtype: Rtype) -> bool {
        self.allowed_requests.is_empty()
            || self
                .allowed_requests
                .iter()
                .any(|t| t.eq_ignore_ascii_case(&qtype.to_string()))
    }
}

fn ip_allowed(allowed: &[IpNet], client: IpAddr) -> bool {
    allowed.iter().any(|cidr| cidr.contains(&client))
}

impl Default for Config {
    fn default() -> Self {
        Config {
            addr: "127.0.0.1:15353".into(),
            axfer_password: "random".into(),
            allowed_requests: [
                "A", "AAAA", "NS", "MX", "SOA", "TXT", "CAA", "ANY", "CNAME", "MB", "MG", "MR",
                "WKS", "PTR", "HINFO", "MINFO", "SPF",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            allowed_xfer: Vec::new(),
            allowed_forwarding: Vec::new(),
            master: MasterConfig::default(),
            forwarder: ForwarderConfig::default(),
            limiter: LimiterConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl TryFrom<&Vec<u8>> for Config {
    type Error = crate::error::Error;

    fn try_from(value: &Vec<u8>) -> Result<Self> {
        Ok(serde_yaml::from_slice(value)?)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct MasterConfig {
    /// Path to a file holding the public DNSKEY as one zone-text line.
    pub dnssec_public_key: Option<String>,
    /// Path to a file holding the base64 PKCS#8 RSA private key.
    pub dnssec_private_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ForwarderConfig {
    /// Hard cap on iterative depth.
    pub max_recursion: u32,
    /// Upstream fan-out per resolve round.
    pub max_nameservers: usize,
    /// Wall-clock timeout of one resolve round, in seconds.
    pub query_timeout: u64,
    pub root_hints_url: String,
    /// Root hints refresh interval, in seconds.
    pub root_hints_refresh: u64,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        ForwarderConfig {
            max_recursion: 20,
            max_nameservers: 4,
            query_timeout: 5,
            root_hints_url: "https://www.internic.net/domain/named.root".into(),
            root_hints_refresh: 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    /// How long limiter entries live, in seconds.
    pub max_age: u64,
    /// Hit threshold past which a client is rate-limited.
    pub max_records: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        LimiterConfig {
            max_age: 2,
            max_records: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    #[serde(deserialize_with = "de_level_filter")]
    pub level: log::LevelFilter,
    pub enable_metrics: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: log::LevelFilter::Info,
            enable_metrics: true,
        }
    }
}

fn de_level_filter<'de, D>(deserializer: D) -> std::result::Result<log::LevelFilter, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: LevelFilter = Deserialize::deserialize(deserializer)?;
    match s {
        LevelFilter::Off => Ok(log::LevelFilter::Off),
        LevelFilter::Error => Ok(log::LevelFilter::Error),
        LevelFilter::Warn => Ok(log::LevelFilter::Warn),
        LevelFilter::Info => Ok(log::LevelFilter::Info),
        LevelFilter::Debug => Ok(log::LevelFilter::Debug),
        LevelFilter::Trace => Ok(log::LevelFilter::Trace),
    }
}

#[derive(Deserialize)]
enum LevelFilter {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}
