//! lbpool - backend pool and traffic-distribution engine for a load balancer
//!
//! This crate provides:
//! - Nodes with connection caps, traffic counters and health state
//! - Clusters with pluggable selection algorithms and session persistence
//! - Active TCP/HTTP health checking with rise/fall thresholds
//! - Thin TCP and UDP frontends, hot configuration reload, Prometheus metrics

pub mod backend;
pub mod config;
pub mod frontend;
pub mod health;
pub mod metrics;
pub mod proxy;
pub mod state;
pub mod util;

pub use backend::{Cluster, ClusterRegistry, Node, NodeHealth};
pub use config::Config;
pub use state::AppState;
