//! Weighted load balancing algorithms.
//!
//! Each node owns a sub-range of length `weight` within a span of
//! `sum(weight)`, laid out in list order. A position in the span, from a
//! cursor or a random draw, selects the node owning that sub-range.

use super::LoadBalancer;
use super::round_robin::Cursor;
use crate::backend::node::Node;
use crate::backend::request::RequestIdentity;
use dashmap::DashMap;
use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

fn total_weight(nodes: &[Arc<Node>]) -> usize {
    nodes.iter().map(|n| n.weight() as usize).sum()
}

/// Index of the node whose sub-range contains `position`.
fn owner_of(nodes: &[Arc<Node>], position: usize) -> usize {
    let mut upper = 0;
    for (idx, node) in nodes.iter().enumerate() {
        upper += node.weight() as usize;
        if position < upper {
            return idx;
        }
    }
    nodes.len() - 1
}

/// Weighted round-robin load balancer.
///
/// Walks the weight span with a cursor: over every `sum(weight)` calls each
/// node is chosen exactly `weight` times.
#[derive(Debug, Default)]
pub struct WeightedRoundRobin {
    cursor: Cursor,
}

impl WeightedRoundRobin {
    /// Create a new weighted round-robin load balancer.
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for WeightedRoundRobin {
    fn select(&self, nodes: &[Arc<Node>], _request: &RequestIdentity) -> Option<Arc<Node>> {
        if nodes.is_empty() {
            return None;
        }
        let position = self.cursor.next(total_weight(nodes));
        Some(Arc::clone(&nodes[owner_of(nodes, position)]))
    }

    fn name(&self) -> &'static str {
        "weighted_round_robin"
    }
}

/// Draws a uniform position in the weight span on every call.
#[derive(Debug, Default, Clone, Copy)]
pub struct WeightedRandom;

impl WeightedRandom {
    /// Create a new weighted random load balancer.
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for WeightedRandom {
    fn select(&self, nodes: &[Arc<Node>], _request: &RequestIdentity) -> Option<Arc<Node>> {
        if nodes.is_empty() {
            return None;
        }
        let position = rand::thread_rng().gen_range(0..total_weight(nodes));
        Some(Arc::clone(&nodes[owner_of(nodes, position)]))
    }

    fn name(&self) -> &'static str {
        "weighted_random"
    }
}

/// Weighted least-connections load balancer.
///
/// Keeps a per-node count of selections made in the current pass over the
/// weight span; the counts reset whenever the cursor wraps. Within a pass a
/// node is eligible until it has been chosen `weight` times, and among the
/// eligible nodes the one with the lowest connections-per-weight wins.
#[derive(Debug, Default)]
pub struct WeightedLeastConnections {
    cursor: Cursor,
    served: DashMap<SocketAddr, AtomicU32>,
}

impl WeightedLeastConnections {
    /// Create a new weighted least-connections load balancer.
    pub fn new() -> Self {
        Self::default()
    }

    fn served(&self, node: &Node) -> u32 {
        self.served
            .get(&node.address())
            .map(|count| count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

impl LoadBalancer for WeightedLeastConnections {
    fn select(&self, nodes: &[Arc<Node>], _request: &RequestIdentity) -> Option<Arc<Node>> {
        if nodes.is_empty() {
            return None;
        }

        let position = self.cursor.next(total_weight(nodes));
        if position == 0 {
            self.served.clear();
        }

        // (index, active connections, served this pass, weight)
        let mut best: Option<(usize, u64, u64, u64)> = None;
        for (idx, node) in nodes.iter().enumerate() {
            let weight = u64::from(node.weight());
            let served = u64::from(self.served(node));
            if served >= weight {
                continue;
            }
            let active = u64::from(node.active_connections());

            let better = match best {
                None => true,
                Some((_, best_active, best_served, best_weight)) => {
                    let load = active * best_weight;
                    let best_load = best_active * weight;
                    load < best_load || (load == best_load && served * best_weight < best_served * weight)
                }
            };
            if better {
                best = Some((idx, active, served, weight));
            }
        }

        // Concurrent callers can exhaust every quota mid-pass; fall back to
        // the plain weighted position.
        let idx = best.map_or_else(|| owner_of(nodes, position), |(idx, ..)| idx);
        let node = &nodes[idx];
        self.served
            .entry(node.address())
            .or_insert_with(|| AtomicU32::new(0))
            .fetch_add(1, Ordering::Relaxed);

        Some(Arc::clone(node))
    }

    fn name(&self) -> &'static str {
        "weighted_least_connections"
    }
}
