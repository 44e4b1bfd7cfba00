//! Least-connections load balancing algorithm.

use super::LoadBalancer;
use super::round_robin::Cursor;
use crate::backend::node::Node;
use crate::backend::request::RequestIdentity;
use std::sync::Arc;

/// Pick the node with the smallest `metric`.
///
/// The scan starts at a rotating cursor, so among tied nodes the choice
/// advances round-robin; when every node is tied this is exactly the
/// cursor's node.
pub(crate) fn least_by<F>(nodes: &[Arc<Node>], cursor: &Cursor, metric: F) -> Option<Arc<Node>>
where
    F: Fn(&Node) -> u64,
{
    if nodes.is_empty() {
        return None;
    }

    let len = nodes.len();
    let start = cursor.next(len);
    let mut best: Option<(usize, u64)> = None;

    for offset in 0..len {
        let idx = (start + offset) % len;
        let value = metric(&nodes[idx]);
        if best.is_none_or(|(_, lowest)| value < lowest) {
            best = Some((idx, value));
        }
    }

    best.map(|(idx, _)| Arc::clone(&nodes[idx]))
}

/// Least-connections load balancer.
///
/// Sends requests to the node with the fewest active connections.
/// Breaks ties using round-robin order.
#[derive(Debug, Default)]
pub struct LeastConnections {
    cursor: Cursor,
}

impl LeastConnections {
    /// Create a new least-connections load balancer.
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for LeastConnections {
    fn select(&self, nodes: &[Arc<Node>], _request: &RequestIdentity) -> Option<Arc<Node>> {
        least_by(nodes, &self.cursor, |node| u64::from(node.active_connections()))
    }

    fn name(&self) -> &'static str {
        "least_connections"
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    #[test]
    fn test_least_conn_selects_lowest() {
        let lc = LeastConnections::new();
        let servers = nodes(3);

        // Add connections to first two servers
        servers[0].admit_connection().unwrap();
        servers[0].admit_connection().unwrap();
        servers[1].admit_connection().unwrap();

        // Server 3 has 0 connections, should be selected
        for _ in 0..5 {
            let selected = lc.select(&servers, &request()).unwrap();
            assert_eq!(position(&servers, &selected), 2);
        }
    }

    #[test]
    fn test_least_conn_ties_rotate() {
        let lc = LeastConnections::new();
        let servers = nodes(3);

        // All tied at zero: falls back to round-robin order
        let picks: Vec<usize> = (0..6)
            .map(|_| position(&servers, &lc.select(&servers, &request()).unwrap()))
            .collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_least_conn_even_split_under_load() {
        let lc = LeastConnections::new();
        let servers = nodes(4);
        let rounds = 10_000;

        for _ in 0..rounds {
            let selected = lc.select(&servers, &request()).unwrap();
            selected.admit_connection().unwrap();
        }

        for node in &servers {
            let count = node.active_connections() as i64;
            assert!((count - rounds / 4).abs() <= 1, "uneven: {count}");
        }
    }

    #[test]
    fn test_least_conn_follows_releases() {
        let lc = LeastConnections::new();
        let servers = nodes(2);
        servers[0].admit_connection().unwrap();
        servers[1].admit_connection().unwrap();
        servers[1].admit_connection().unwrap();

        assert_eq!(position(&servers, &lc.select(&servers, &request()).unwrap()), 0);

        servers[1].release_connection().unwrap();
        servers[1].release_connection().unwrap();
        assert_eq!(position(&servers, &lc.select(&servers, &request()).unwrap()), 1);
    }

    #[test]
    fn test_least_conn_empty() {
        let lc = LeastConnections::new();
        assert!(lc.select(&[], &request()).is_none());
    }
}
