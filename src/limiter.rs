//! Per-client short-window query cache. Identical questions from the same
//! client replay the cached answer; past the hit ceiling the client gets no
//! reply at all until its entries age out.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::LimiterConfig;
use crate::message::Reply;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimiterStatus {
    RateLimited,
    Miss,
    Cached,
}

#[derive(Debug)]
struct Entry {
    reply: Reply,
    expires: Instant,
    hits: u64,
}

#[derive(Debug)]
struct Inner {
    settings: LimiterConfig,
    source: HashMap<String, Vec<Entry>>,
}

/// All state sits behind one lock: lookups mutate hit counters, so there is
/// no shared read path to speak of.
#[derive(Debug)]
pub struct Limiter {
    inner: Mutex<Inner>,
}

impl Limiter {
    pub fn new(settings: LimiterConfig) -> Arc<Limiter> {
        Arc::new(Limiter {
            inner: Mutex::new(Inner {
                settings,
                source: HashMap::new(),
            }),
        })
    }

    /// Creates the limiter and starts its background sweeper.
    pub fn start(settings: LimiterConfig) -> Arc<Limiter> {
        let limiter = Self::new(settings);
        let sweeper = limiter.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                sweeper.sweep();
            }
        });
        limiter
    }

    /// The thresholds may be hot-swapped; everything else is fixed at start.
    pub fn load_settings(&self, settings: LimiterConfig) {
        let mut inner = self.inner.lock().unwrap();
        inner.settings = settings;
    }

    /// Checks the client's window for an entry answering the same question
    /// set. A hit replays the cached sections into `reply` and counts against
    /// the client; past the ceiling the caller must drop the request
    /// silently.
    pub fn lookup(&self, client: IpAddr, reply: &mut Reply) -> LimiterStatus {
        let mut inner = self.inner.lock().unwrap();
        let max_records = inner.settings.max_records;
        let Some(entries) = inner.source.get_mut(&client.to_string()) else {
            return LimiterStatus::Miss;
        };
        for entry in entries {
            if entry.reply.questions == reply.questions {
                if entry.hits > max_records {
                    return LimiterStatus::RateLimited;
                }
                reply.answer = entry.reply.answer.clone();
                reply.authority = entry.reply.authority.clone();
                reply.additional = entry.reply.additional.clone();
                reply.authoritative = entry.reply.authoritative;
                reply.recursion_available = entry.reply.recursion_available;
                reply.edns = entry.reply.edns;
                entry.hits += 1;
                return LimiterStatus::Cached;
            }
        }
        LimiterStatus::Miss
    }

    /// Remembers a served reply for the client. No dedup; duplicates age out
    /// on their own.
    pub fn store(&self, client: IpAddr, reply: &Reply) {
        let mut inner = self.inner.lock().unwrap();
        let expires = Instant::now() + Duration::from_secs(inner.settings.max_age);
        inner
            .source
            .entry(client.to_string())
            .or_default()
            .push(Entry {
                reply: reply.clone(),
                expires,
                hits: 0,
            });
    }

    fn sweep(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        inner.source.retain(|_, entries| {
            entries.retain(|entry| entry.expires > now);
            !entries.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Question;
    use domain::base::iana::Rcode;
    use domain::base::Rtype;
    use std::net::Ipv4Addr;

    fn client() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    fn reply(qname: &str) -> Reply {
        Reply {
            questions: vec![Question {
                qname: qname.into(),
                qtype: Rtype::A,
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

    fn settings(max_records: u64, max_age: u64) -> LimiterConfig {
        LimiterConfig {
            max_records,
            max_age,
        }
    }

    #[test]
    fn miss_then_cached_replay() {
        let limiter = Limiter::new(settings(10, 2));
        let mut served = reply("www.example.com.");
        served.authoritative = true;
        served.answer.push(crate::cache::Record {
            name: "www".into(),
            domain: "example.com.".into(),
            target: "1.2.3.4".into(),
            online: true,
            ..Default::default()
        });

        let mut probe = reply("www.example.com.");
        assert_eq!(limiter.lookup(client(), &mut probe), LimiterStatus::Miss);
        limiter.store(client(), &served);

        let mut probe = reply("www.example.com.");
        assert_eq!(limiter.lookup(client(), &mut probe), LimiterStatus::Cached);
        assert_eq!(probe.answer.len(), 1);
        assert!(probe.authoritative);
    }

    #[test]
    fn different_question_is_a_miss() {
        let limiter = Limiter::new(settings(10, 2));
        limiter.store(client(), &reply("www.example.com."));
        let mut probe = reply("mail.example.com.");
        assert_eq!(limiter.lookup(client(), &mut probe), LimiterStatus::Miss);
    }

    #[test]
    fn hit_ceiling_rate_limits() {
        let limiter = Limiter::new(settings(10, 2));
        limiter.store(client(), &reply("www.example.com."));

        for _ in 0..11 {
            let mut probe = reply("www.example.com.");
            assert_eq!(limiter.lookup(client(), &mut probe), LimiterStatus::Cached);
        }
        let mut probe = reply("www.example.com.");
        assert_eq!(
            limiter.lookup(client(), &mut probe),
            LimiterStatus::RateLimited
        );
    }

    #[test]
    fn other_clients_are_unaffected() {
        let limiter = Limiter::new(settings(0, 2));
        limiter.store(client(), &reply("www.example.com."));
        let mut probe = reply("www.example.com.");
        let other = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2));
        assert_eq!(limiter.lookup(other, &mut probe), LimiterStatus::Miss);
    }

    #[test]
    fn thresholds_can_be_hot_swapped() {
        let limiter = Limiter::new(settings(10, 2));
        limiter.store(client(), &reply("www.example.com."));
        limiter.load_settings(settings(0, 2));

        let mut probe = reply("www.example.com.");
        assert_eq!(limiter.lookup(client(), &mut probe), LimiterStatus::Cached);
        let mut probe = reply("www.example.com.");
        assert_eq!(
            limiter.lookup(client(), &mut probe),
            LimiterStatus::RateLimited
        );
    }

    #[test]
    fn sweep_ages_out_entries() {
        let limiter = Limiter::new(settings(10, 0));
        limiter.store(client(), &reply("www.example.com."));
        std::thread::sleep(Duration::from_millis(10));
        limiter.sweep();
        let mut probe = reply("www.example.com.");
        assert_eq!(limiter.lookup(client(), &mut probe), LimiterStatus::Miss);
    }
}
