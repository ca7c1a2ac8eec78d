//! Root hints: a compiled-in named.root snapshot loaded at startup and an
//! HTTPS refresh that replaces it in place. A failed fetch keeps whatever
//! snapshot is live.

use std::time::Duration;

use crate::error::Result;

use super::Forwarder;

/// Snapshot of <https://www.internic.net/domain/named.root>, with the class
/// spelled out for the zone parser.
pub(crate) const ROOT_HINTS: &str = "\
;       This file holds the information on root name servers needed to
;       initialize cache of Internet domain name servers.
.                        3600000 IN NS    a.root-servers.net.
.                        3600000 IN NS    b.root-servers.net.
.                        3600000 IN NS    c.root-servers.net.
.                        3600000 IN NS    d.root-servers.net.
.                        3600000 IN NS    e.root-servers.net.
.                        3600000 IN NS    f.root-servers.net.
.                        3600000 IN NS    g.root-servers.net.
.                        3600000 IN NS    h.root-servers.net.
.                        3600000 IN NS    i.root-servers.net.
.                        3600000 IN NS    j.root-servers.net.
.                        3600000 IN NS    k.root-servers.net.
.                        3600000 IN NS    l.root-servers.net.
.                        3600000 IN NS    m.root-servers.net.
a.root-servers.net.      3600000 IN A     198.41.0.4
a.root-servers.net.      3600000 IN AAAA  2001:503:ba3e::2:30
b.root-servers.net.      3600000 IN A     170.247.170.2
b.root-servers.net.      3600000 IN AAAA  2801:1b8:10::b
c.root-servers.net.      3600000 IN A     192.33.4.12
c.root-servers.net.      3600000 IN AAAA  2001:500:2::c
d.root-servers.net.      3600000 IN A     199.7.91.13
d.root-servers.net.      3600000 IN AAAA  2001:500:2d::d
e.root-servers.net.      3600000 IN A     192.203.230.10
e.root-servers.net.      3600000 IN AAAA  2001:500:a8::e
f.root-servers.net.      3600000 IN A     192.5.5.241
f.root-servers.net.      3600000 IN AAAA  2001:500:2f::f
g.root-servers.net.      3600000 IN A     192.112.36.4
g.root-servers.net.      3600000 IN AAAA  2001:500:12::d0d
h.root-servers.net.      3600000 IN A     198.97.190.53
h.root-servers.net.      3600000 IN AAAA  2001:500:1::53
i.root-servers.net.      3600000 IN A     192.36.148.17
i.root-servers.net.      3600000 IN AAAA  2001:7fe::53
j.root-servers.net.      3600000 IN A     192.58.128.30
j.root-servers.net.      3600000 IN AAAA  2001:503:c27::2:30
k.root-servers.net.      3600000 IN A     193.0.14.129
k.root-servers.net.      3600000 IN AAAA  2001:7fd::1
l.root-servers.net.      3600000 IN A     199.7.83.42
l.root-servers.net.      3600000 IN AAAA  2001:500:9f::42
m.root-servers.net.      3600000 IN A     202.12.27.33
m.root-servers.net.      3600000 IN AAAA  2001:dc3::35
";

impl Forwarder {
    pub(crate) fn parse_root_hints(&self, body: &str) {
        let records = self.store.import_zone(body);
        log::info!(target: "forwarder", "imported {} root hint records", records.len());
    }

    async fn fetch_root_hints(&self) -> Result<String> {
        let response = reqwest::get(&self.settings.root_hints_url).await?;
        if response.status().as_u16() != 200 {
            return Err(
                error!(Http => "root hints fetch returned status {}", response.status()),
            );
        }
        Ok(response.text().await?)
    }

    /// Fetches the hints now and on every refresh interval. Errors keep the
    /// previous snapshot in place.
    pub(crate) async fn root_hints_loop(&self) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.settings.root_hints_refresh));
        loop {
            interval.tick().await;
            match self.fetch_root_hints().await {
                Ok(hints) => self.parse_root_hints(&hints),
                Err(e) => {
                    log::warn!(target: "forwarder", "failed to refresh root hints from {}: {}",
                        self.settings.root_hints_url, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Status;
    use crate::config::ForwarderConfig;
    use domain::base::Rtype;
    use std::net::{IpAddr, Ipv4Addr};

    fn client() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    #[test]
    fn embedded_hints_cover_all_thirteen_servers() {
        let forwarder = Forwarder::new(ForwarderConfig::default());
        for server in "abcdefghijklm".chars() {
            let (a, status) =
                forwarder
                    .store
                    .get("root-servers.net.", Rtype::A, &server.to_string(), client(), false);
            assert_eq!(status, Status::Found, "missing A for {}", server);
            assert_eq!(a.len(), 1);

            let (aaaa, status) = forwarder.store.get(
                "root-servers.net.",
                Rtype::AAAA,
                &server.to_string(),
                client(),
                false,
            );
            assert_eq!(status, Status::Found, "missing AAAA for {}", server);
            assert_eq!(aaaa.len(), 1);
        }
    }

    #[test]
    fn reimport_replaces_root_server_addresses() {
        let forwarder = Forwarder::new(ForwarderConfig::default());
        forwarder.parse_root_hints("a.root-servers.net. 3600000 IN A 198.41.0.99\n");

        let (records, _) = forwarder
            .store
            .get("root-servers.net.", Rtype::A, "a", client(), false);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].target, "198.41.0.99");
    }
}
