//! Uniform random selection.

use super::LoadBalancer;
use crate::backend::node::Node;
use crate::backend::request::RequestIdentity;
use rand::Rng;
use std::sync::Arc;

/// Picks a node uniformly at random on every call.
#[derive(Debug, Default, Clone, Copy)]
pub struct Random;

impl Random {
    /// Create a new random load balancer.
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for Random {
    fn select(&self, nodes: &[Arc<Node>], _request: &RequestIdentity) -> Option<Arc<Node>> {
        if nodes.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..nodes.len());
        Some(Arc::clone(&nodes[idx]))
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    #[test]
    fn test_random_is_roughly_uniform() {
        let lb = Random::new();
        let servers = nodes(4);
        let mut counts = [0usize; 4];

        for _ in 0..40_000 {
            counts[position(&servers, &lb.select(&servers, &request()).unwrap())] += 1;
        }

        for count in counts {
            assert!((9_000..=11_000).contains(&count), "skewed: {counts:?}");
        }
    }

    #[test]
    fn test_random_single_node() {
        let lb = Random::new();
        let servers = nodes(1);
        let selected = lb.select(&servers, &request()).unwrap();
        assert!(Arc::ptr_eq(&selected, &servers[0]));
    }
}
