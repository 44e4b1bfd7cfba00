//! Source-address stickiness by network prefix.

use super::LoadBalancer;
use super::round_robin::Cursor;
use crate::backend::cache::TtlCache;
use crate::backend::node::Node;
use crate::backend::request::RequestIdentity;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

/// Most prefixes remembered at once.
pub const DEFAULT_CAPACITY: usize = 1_000_000;

/// How long a prefix keeps its node without being seen again; every
/// selection for the prefix restarts the clock.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// Reduce an address to the prefix that shares a node: /24 for IPv4, /48
/// for IPv6. IPv4-mapped IPv6 addresses are treated as IPv4.
pub fn prefix_key(ip: IpAddr) -> IpAddr {
    match ip.to_canonical() {
        IpAddr::V4(v4) => IpAddr::V4(Ipv4Addr::from(v4.to_bits() & 0xffff_ff00)),
        IpAddr::V6(v6) => IpAddr::V6(Ipv6Addr::from(v6.to_bits() & (!0u128 << 80))),
    }
}

/// Source IP hash load balancer.
///
/// Clients in the same prefix land on the same node for as long as their
/// assignment stays cached. A prefix seen for the first time, or whose node
/// is no longer eligible, is assigned the next node in round-robin order.
pub struct SourceIpHash {
    assignments: TtlCache<IpAddr, SocketAddr>,
    cursor: Cursor,
}

impl SourceIpHash {
    /// Create a source-IP hash load balancer with the default cache limits.
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_CAPACITY, DEFAULT_TTL)
    }

    /// Create one remembering at most `capacity` prefixes, each for `ttl`
    /// after it was last seen.
    pub fn with_limits(capacity: usize, ttl: Duration) -> Self {
        Self {
            assignments: TtlCache::new(capacity, ttl),
            cursor: Cursor::new(),
        }
    }
}

impl Default for SourceIpHash {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for SourceIpHash {
    fn select(&self, nodes: &[Arc<Node>], request: &RequestIdentity) -> Option<Arc<Node>> {
        if nodes.is_empty() {
            return None;
        }

        let key = prefix_key(request.source().ip());
        if let Some(assigned) = self.assignments.get(&key) {
            if let Some(node) = nodes.iter().find(|n| n.address() == assigned) {
                return Some(Arc::clone(node));
            }
        }

        let node = &nodes[self.cursor.next(nodes.len())];
        self.assignments.insert(key, node.address());
        Some(Arc::clone(node))
    }

    fn name(&self) -> &'static str {
        "source_ip_hash"
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    fn from(addr: &str) -> RequestIdentity {
        RequestIdentity::new(addr.parse().unwrap())
    }

    #[test]
    fn test_prefix_key() {
        assert_eq!(
            prefix_key("192.168.1.100".parse().unwrap()),
            "192.168.1.0".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            prefix_key("2001:db8:abcd:12::1".parse().unwrap()),
            "2001:db8:abcd::".parse::<IpAddr>().unwrap()
        );
        assert_eq!(
            prefix_key("::ffff:10.1.2.3".parse().unwrap()),
            "10.1.2.0".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn test_same_prefix_same_node() {
        let lb = SourceIpHash::new();
        let servers = nodes(4);

        let first = lb.select(&servers, &from("192.168.1.100:12345")).unwrap();
        for client in ["192.168.1.100:1", "192.168.1.7:999", "192.168.1.254:40000"] {
            let selected = lb.select(&servers, &from(client)).unwrap();
            assert!(Arc::ptr_eq(&first, &selected), "{client}");
        }
    }

    #[test]
    fn test_distinct_prefixes_spread() {
        let lb = SourceIpHash::new();
        let servers = nodes(4);
        let mut counts = [0usize; 4];

        for i in 0..400u32 {
            let client = format!("10.{}.{}.1:5000", i / 256, i % 256);
            counts[position(&servers, &lb.select(&servers, &from(&client)).unwrap())] += 1;
        }

        assert_eq!(counts, [100, 100, 100, 100]);
    }

    #[test]
    fn test_reassigns_when_node_leaves() {
        let lb = SourceIpHash::new();
        let servers = nodes(3);
        let client = from("172.16.5.5:80");

        let first = lb.select(&servers, &client).unwrap();
        let remaining: Vec<_> = servers
            .iter()
            .filter(|n| !Arc::ptr_eq(n, &first))
            .cloned()
            .collect();

        let second = lb.select(&remaining, &client).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        // And the new assignment sticks
        let third = lb.select(&remaining, &client).unwrap();
        assert!(Arc::ptr_eq(&second, &third));
    }

    #[test]
    fn test_active_prefix_keeps_node_past_ttl() {
        let lb = SourceIpHash::with_limits(16, Duration::from_millis(100));
        let servers = nodes(4);
        let client = from("10.0.0.1:1");

        let first = lb.select(&servers, &client).unwrap();
        for _ in 0..15 {
            std::thread::sleep(Duration::from_millis(20));
            let selected = lb.select(&servers, &client).unwrap();
            assert!(Arc::ptr_eq(&first, &selected));
        }
    }

    #[test]
    fn test_assignment_expires() {
        let lb = SourceIpHash::with_limits(16, Duration::from_millis(20));
        let servers = nodes(2);
        let client = from("10.0.0.1:1");

        let first = lb.select(&servers, &client).unwrap();
        std::thread::sleep(Duration::from_millis(40));
        let second = lb.select(&servers, &client).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }
}
