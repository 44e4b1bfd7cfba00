//! Round-robin load balancing algorithm.

use super::LoadBalancer;
use crate::backend::node::Node;
use crate::backend::request::RequestIdentity;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A shared position that advances by one per call.
#[derive(Debug, Default)]
pub(crate) struct Cursor {
    position: AtomicUsize,
}

impl Cursor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// The next position in `0..len`.
    ///
    /// When `len` shrank since the last call the stored position is wrapped
    /// back into range instead of indexing past the end.
    pub(crate) fn next(&self, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        let previous = match self.position.fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| {
            Some((p % len + 1) % len)
        }) {
            Ok(p) | Err(p) => p,
        };
        previous % len
    }
}

/// Round-robin load balancer.
///
/// Distributes requests evenly across all nodes in insertion order.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: Cursor,
}

impl RoundRobin {
    /// Create a new round-robin load balancer.
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobin {
    fn select(&self, nodes: &[Arc<Node>], _request: &RequestIdentity) -> Option<Arc<Node>> {
        if nodes.is_empty() {
            return None;
        }

        let idx = self.cursor.next(nodes.len());
        Some(Arc::clone(&nodes[idx]))
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}
