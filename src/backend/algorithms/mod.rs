//! Load balancing algorithms.
//!
//! Every algorithm receives the currently eligible nodes, in cluster
//! insertion order, and returns one of them. None of them mutate the list
//! or return a node from outside it.

mod ip_hash;
mod least_conn;
mod least_load;
mod random;
mod round_robin;
mod weighted;

pub use ip_hash::{SourceIpHash, prefix_key};
pub use least_conn::LeastConnections;
pub use least_load::LeastLoad;
pub use random::Random;
pub use round_robin::RoundRobin;
pub use weighted::{WeightedLeastConnections, WeightedRandom, WeightedRoundRobin};

use crate::backend::node::Node;
use crate::backend::request::RequestIdentity;
use crate::config::Algorithm;
use std::sync::Arc;

/// Trait for load balancing algorithms.
pub trait LoadBalancer: Send + Sync {
    /// Select the next backend node.
    ///
    /// # Arguments
    ///
    /// * `nodes` - Eligible nodes, in insertion order
    /// * `request` - Identity of the request being routed
    ///
    /// # Returns
    ///
    /// One of `nodes`, or `None` if `nodes` is empty.
    fn select(&self, nodes: &[Arc<Node>], request: &RequestIdentity) -> Option<Arc<Node>>;

    /// Short name for logs and status output.
    fn name(&self) -> &'static str;
}

/// Build a fresh instance of `algorithm`.
pub fn build(algorithm: Algorithm) -> Box<dyn LoadBalancer> {
    match algorithm {
        Algorithm::RoundRobin => Box::new(RoundRobin::new()),
        Algorithm::Random => Box::new(Random::new()),
        Algorithm::LeastConnections => Box::new(LeastConnections::new()),
        Algorithm::LeastLoad => Box::new(LeastLoad::new()),
        Algorithm::WeightedRoundRobin => Box::new(WeightedRoundRobin::new()),
        Algorithm::WeightedRandom => Box::new(WeightedRandom::new()),
        Algorithm::WeightedLeastConnections => Box::new(WeightedLeastConnections::new()),
        Algorithm::SourceIpHash => Box::new(SourceIpHash::new()),
    }
}
