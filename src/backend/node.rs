//! A single backend endpoint and its live counters.
//!
//! Every field the data path touches is atomic: admission and release use a
//! compare-and-swap loop on the connection counter, and the health flag is
//! written only by the node's health check while selection reads it
//! wait-free.

use crate::backend::error::{BackendError, BackendResult};
use crate::config::NodeConfig;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering};
use tracing::warn;

/// Health state of a node, as last reported by its health check.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeHealth {
    /// The last probes succeeded; the node is eligible for selection.
    Good = 0,
    /// The last probes failed, or the node has not been probed yet.
    Bad = 1,
}

impl NodeHealth {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Good,
            _ => Self::Bad,
        }
    }
}

impl fmt::Display for NodeHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Good => f.write_str("GOOD"),
            Self::Bad => f.write_str("BAD"),
        }
    }
}

/// Direction of traffic relative to the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Bytes read from the node.
    Received,
    /// Bytes written to the node.
    Sent,
}

/// One backend server entry with weight, capacity, health and counters.
///
/// New nodes start [`NodeHealth::Bad`]: a node only becomes eligible after
/// its health check has seen it answer.
pub struct Node {
    address: SocketAddr,
    weight: u32,
    /// Connection cap; `None` means unlimited.
    limit: Option<u32>,
    max_connections: i64,
    active_connections: AtomicU32,
    total_connections: AtomicU64,
    health: AtomicU8,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    load: AtomicU64,
}

impl Node {
    /// Create a node.
    ///
    /// `weight` must be at least 1. `max_connections` of `-1` or `0` means
    /// unlimited, a positive value is a hard cap; anything below `-1` is
    /// rejected.
    pub fn new(address: SocketAddr, weight: u32, max_connections: i64) -> BackendResult<Self> {
        if weight == 0 {
            return Err(BackendError::InvalidConfiguration(format!(
                "node {address}: weight must be >= 1"
            )));
        }
        if max_connections < -1 {
            return Err(BackendError::InvalidConfiguration(format!(
                "node {address}: max_connections must be >= -1, got {max_connections}"
            )));
        }
        let limit = match max_connections {
            n if n > 0 => Some(u32::try_from(n).map_err(|_| {
                BackendError::InvalidConfiguration(format!(
                    "node {address}: max_connections {n} exceeds {}",
                    u32::MAX
                ))
            })?),
            _ => None,
        };

        Ok(Self {
            address,
            weight,
            limit,
            max_connections,
            active_connections: AtomicU32::new(0),
            total_connections: AtomicU64::new(0),
            health: AtomicU8::new(NodeHealth::Bad as u8),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            load: AtomicU64::new(0),
        })
    }

    /// Create a node from its configuration entry.
    pub fn from_config(config: &NodeConfig) -> BackendResult<Self> {
        Self::new(config.address, config.weight, config.max_connections)
    }

    /// Address the node serves on; unique within a cluster.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Relative share of traffic for the weighted strategies.
    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// The configured cap as given (`-1` or `0` for unlimited).
    pub fn max_connections(&self) -> i64 {
        self.max_connections
    }

    /// The effective connection cap, if any.
    pub fn capacity(&self) -> Option<u32> {
        self.limit
    }

    /// Connections currently admitted and not yet released.
    pub fn active_connections(&self) -> u32 {
        self.active_connections.load(Ordering::Acquire)
    }

    /// Every connection ever admitted to this node.
    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    /// Last health state set by the node's probe task.
    pub fn health(&self) -> NodeHealth {
        NodeHealth::from_u8(self.health.load(Ordering::Acquire))
    }

    /// Whether the node is currently eligible for selection.
    pub fn is_online(&self) -> bool {
        self.health() == NodeHealth::Good
    }

    /// Set the health state, returning the previous one.
    ///
    /// Only the node's health check calls this.
    pub(crate) fn set_health(&self, health: NodeHealth) -> NodeHealth {
        NodeHealth::from_u8(self.health.swap(health as u8, Ordering::AcqRel))
    }

    /// Admit one connection.
    ///
    /// Fails with [`BackendError::CapacityExceeded`] when the node is at its
    /// cap, leaving the counter untouched. Returns the new count.
    pub fn admit_connection(&self) -> BackendResult<u32> {
        let mut current = self.active_connections.load(Ordering::Acquire);
        loop {
            if let Some(limit) = self.limit {
                if current >= limit {
                    return Err(BackendError::CapacityExceeded(self.address, limit));
                }
            }
            match self.active_connections.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.total_connections.fetch_add(1, Ordering::Relaxed);
                    return Ok(current + 1);
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Release one connection. Returns the new count.
    ///
    /// Releasing on a zero counter is a caller bug: it is reported as
    /// [`BackendError::ConnectionUnderflow`] and the counter stays at zero.
    pub fn release_connection(&self) -> BackendResult<u32> {
        let mut current = self.active_connections.load(Ordering::Acquire);
        loop {
            if current == 0 {
                warn!(node = %self.address, "connection released with no active connections");
                return Err(BackendError::ConnectionUnderflow(self.address));
            }
            match self.active_connections.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(current - 1),
                Err(actual) => current = actual,
            }
        }
    }

    /// Admit a connection and tie its release to the returned guard.
    pub fn try_acquire(self: &Arc<Self>) -> BackendResult<ConnectionGuard> {
        self.admit_connection()?;
        Ok(ConnectionGuard {
            node: Arc::clone(self),
        })
    }

    /// Add `bytes` to the counter for `direction`.
    pub fn record_bytes(&self, direction: Direction, bytes: u64) {
        let counter = match direction {
            Direction::Received => &self.bytes_received,
            Direction::Sent => &self.bytes_sent,
        };
        counter.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Bytes read from this node.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Bytes written to this node.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Externally supplied load figure used by the least-load strategy.
    pub fn load(&self) -> u64 {
        self.load.load(Ordering::Relaxed)
    }

    /// Publish a new load figure for this node.
    pub fn set_load(&self, load: u64) {
        self.load.store(load, Ordering::Relaxed);
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("address", &self.address)
            .field("weight", &self.weight)
            .field("max_connections", &self.max_connections)
            .field("active_connections", &self.active_connections())
            .field("health", &self.health())
            .finish()
    }
}

/// An admitted connection; releases its slot on the node when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    node: Arc<Node>,
}

impl ConnectionGuard {
    /// The node this guard holds a slot on.
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let _ = self.node.release_connection();
    }
}
