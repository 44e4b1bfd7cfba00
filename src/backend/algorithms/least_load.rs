//! Least-load selection driven by an externally reported load figure.

use super::LoadBalancer;
use super::least_conn::least_by;
use super::round_robin::Cursor;
use crate::backend::node::Node;
use crate::backend::request::RequestIdentity;
use std::sync::Arc;

/// Like [`LeastConnections`](super::LeastConnections), but ranks nodes by
/// [`Node::load`] instead of their connection count.
#[derive(Debug, Default)]
pub struct LeastLoad {
    cursor: Cursor,
}

impl LeastLoad {
    /// Create a new least-load load balancer.
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for LeastLoad {
    fn select(&self, nodes: &[Arc<Node>], _request: &RequestIdentity) -> Option<Arc<Node>> {
        least_by(nodes, &self.cursor, Node::load)
    }

    fn name(&self) -> &'static str {
        "least_load"
    }
}
