//! Composable orderings over a slice of live records, driven by the records'
//! `balance_mode` string and the client address.

use std::net::IpAddr;

use super::{Record, Status};

/// Applies a single balance mode in place. Sorting modes use stable sorts so
/// they compose; filter modes shrink the set.
pub fn sort(records: &mut Vec<Record>, ip: IpAddr, mode: &str) -> Result<(), Status> {
    match mode {
        "roundrobin" => records.sort_by_key(|r| r.statistics.requests()),
        "leastconnected" => {
            // Fall back to the round robin key until connection counts exist.
            if records.iter().all(|r| r.statistics.connected() == 0) {
                records.sort_by_key(|r| r.statistics.requests());
            } else {
                records.sort_by_key(|r| r.statistics.connected());
            }
        }
        "leasttraffic" => {
            // Fall back to the round robin key until RX/TX counts exist.
            if records.iter().all(|r| r.statistics.traffic() == 0) {
                records.sort_by_key(|r| r.statistics.requests());
            } else {
                records.sort_by_key(|r| r.statistics.traffic());
            }
        }
        "preference" => records.sort_by_key(|r| r.preference),
        "topology" => topology(records, ip),
        "firstavailable" => records.truncate(1),
        _ => return Err(Status::ErrBalanceFailure),
    }
    Ok(())
}

/// Applies a comma-separated list of modes. The list is reversed first: with
/// stable sorts, the later modes in the list end up as the primary key, so
/// `leastconnected,topology` filters on topology before ordering by
/// connection count.
pub fn multi_sort(records: &mut Vec<Record>, ip: IpAddr, modes: &str) -> Result<(), Status> {
    for mode in modes.split(',').rev() {
        sort(records, ip, mode)?;
    }
    Ok(())
}

/// Keeps only records whose local networks contain the client. An empty match
/// leaves the input unchanged.
fn topology(records: &mut Vec<Record>, ip: IpAddr) {
    let matches: Vec<Record> = records
        .iter()
        .filter(|record| record.local_networks.iter().any(|net| net.contains(&ip)))
        .cloned()
        .collect();
    if !matches.is_empty() {
        *records = matches;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Statistics;
    use domain::base::Rtype;
    use std::net::Ipv4Addr;

    fn client() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    fn balanced(target: &str, mode: &str, statistics: Statistics) -> Record {
        Record {
            name: mode.into(),
            domain: "example.com.".into(),
            rtype: Rtype::A,
            target: target.into(),
            balance_mode: mode.into(),
            statistics,
            online: true,
            ..Default::default()
        }
    }

    #[test]
    fn roundrobin_orders_by_request_count() {
        let mut records = vec![
            balanced("1.2.3.4", "roundrobin", Statistics::new(2, 0, 0, 0)),
            balanced("127.0.0.1", "roundrobin", Statistics::new(1, 0, 0, 0)),
        ];
        multi_sort(&mut records, client(), "roundrobin").unwrap();
        assert_eq!(records[0].target, "127.0.0.1");
    }

    #[test]
    fn leastconnected_orders_by_connection_count() {
        let mut records = vec![
            balanced("1.2.3.4", "leastconnected", Statistics::new(0, 2, 0, 0)),
            balanced("127.0.0.1", "leastconnected", Statistics::new(0, 1, 0, 0)),
        ];
        multi_sort(&mut records, client(), "leastconnected").unwrap();
        assert_eq!(records[0].target, "127.0.0.1");
    }

    #[test]
    fn leastconnected_falls_back_to_roundrobin() {
        let mut records = vec![
            balanced("1.2.3.4", "leastconnected", Statistics::new(5, 0, 0, 0)),
            balanced("127.0.0.1", "leastconnected", Statistics::new(1, 0, 0, 0)),
        ];
        multi_sort(&mut records, client(), "leastconnected").unwrap();
        assert_eq!(records[0].target, "127.0.0.1");
    }

    #[test]
    fn leasttraffic_orders_by_rx_plus_tx() {
        let mut records = vec![
            balanced("1.2.3.4", "leasttraffic", Statistics::new(0, 0, 2, 2)),
            balanced("127.0.0.1", "leasttraffic", Statistics::new(0, 0, 1, 1)),
        ];
        multi_sort(&mut records, client(), "leasttraffic").unwrap();
        assert_eq!(records[0].target, "127.0.0.1");
    }

    #[test]
    fn preference_orders_ascending() {
        let mut a = balanced("1.2.3.4", "preference", Statistics::default());
        a.preference = 2;
        let mut b = balanced("127.0.0.1", "preference", Statistics::default());
        b.preference = 1;
        let mut records = vec![a, b];
        multi_sort(&mut records, client(), "preference").unwrap();
        assert_eq!(records[0].target, "127.0.0.1");
    }

    #[test]
    fn topology_filters_on_client_network() {
        let mut a = balanced("1.2.3.4", "topology", Statistics::default());
        a.local_networks = vec!["127.0.0.2/32".parse().unwrap()];
        let mut b = balanced("127.0.0.1", "topology", Statistics::default());
        b.local_networks = vec!["127.0.0.1/32".parse().unwrap()];
        let mut records = vec![a, b];
        multi_sort(&mut records, client(), "topology").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].target, "127.0.0.1");
    }

    #[test]
    fn topology_without_match_returns_input_unchanged() {
        let mut a = balanced("1.2.3.4", "topology", Statistics::default());
        a.local_networks = vec!["10.0.0.0/8".parse().unwrap()];
        let mut records = vec![a];
        multi_sort(&mut records, client(), "topology").unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn firstavailable_keeps_the_first_entry() {
        let mut records = vec![
            balanced("127.0.0.1", "firstavailable", Statistics::default()),
            balanced("1.2.3.5", "firstavailable", Statistics::default()),
        ];
        multi_sort(&mut records, client(), "firstavailable").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].target, "127.0.0.1");
    }

    #[test]
    fn unknown_mode_fails() {
        let mut records = vec![balanced("1.2.3.4", "bogus", Statistics::default())];
        assert_eq!(
            multi_sort(&mut records, client(), "bogus"),
            Err(Status::ErrBalanceFailure)
        );
    }

    #[test]
    fn csv_reversal_makes_the_last_mode_primary() {
        // topology runs first (filter), leastconnected then orders what is
        // left, so the reply is the local record regardless of counters.
        let mut a = balanced("1.2.3.4", "", Statistics::new(0, 1, 0, 0));
        a.local_networks = vec!["127.0.0.1/32".parse().unwrap()];
        let mut b = balanced("127.0.0.2", "", Statistics::new(0, 2, 0, 0));
        b.local_networks = vec!["127.0.0.2/32".parse().unwrap()];
        let mut records = vec![b, a];
        multi_sort(&mut records, client(), "leastconnected,topology").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].target, "1.2.3.4");
    }

    #[test]
    fn repeated_sorts_are_stable() {
        let mut records = vec![
            balanced("1.2.3.4", "roundrobin", Statistics::new(1, 0, 0, 0)),
            balanced("1.2.3.5", "roundrobin", Statistics::new(1, 0, 0, 0)),
            balanced("1.2.3.6", "roundrobin", Statistics::new(0, 0, 0, 0)),
        ];
        multi_sort(&mut records, client(), "roundrobin").unwrap();
        let first: Vec<String> = records.iter().map(|r| r.target.clone()).collect();
        multi_sort(&mut records, client(), "roundrobin").unwrap();
        let second: Vec<String> = records.iter().map(|r| r.target.clone()).collect();
        assert_eq!(first, second);
        assert_eq!(first, vec!["1.2.3.6", "1.2.3.4", "1.2.3.5"]);
    }
}
