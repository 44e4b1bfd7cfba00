//! Backend pool management and load balancing algorithms.

pub mod algorithms;
mod cache;
mod cluster;
mod error;
mod node;
pub mod persistence;
mod registry;
mod request;

pub use cache::TtlCache;
pub use cluster::{Cluster, ClusterOptions, ClusterStatus, NodeStatus};
pub use error::{BackendError, BackendResult};
pub use node::{ConnectionGuard, Direction, Node, NodeHealth};
pub use persistence::{HashPersistence, NoPersistence, SessionPersistence};
pub use registry::ClusterRegistry;
pub use request::RequestIdentity;
