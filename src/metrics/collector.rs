//! Metrics collector using prometheus-client.
//!
//! Provides metrics for node health, connections, selections, traffic and
//! the UDP backlog.

use crate::backend::{Direction, NodeHealth};
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Labels for per-node metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct NodeLabels {
    pub cluster: String,
    pub node: String,
}

impl NodeLabels {
    fn new(cluster: &str, node: SocketAddr) -> Self {
        Self {
            cluster: cluster.to_string(),
            node: node.to_string(),
        }
    }
}

/// Labels for per-cluster metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ClusterLabels {
    pub cluster: String,
}

/// Labels for bytes transferred metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BytesLabels {
    pub cluster: String,
    pub node: String,
    pub direction: TrafficDirection,
}

/// Direction of bytes transfer, relative to the node.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum TrafficDirection {
    Received,
    Sent,
}

impl From<Direction> for TrafficDirection {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Received => TrafficDirection::Received,
            Direction::Sent => TrafficDirection::Sent,
        }
    }
}

/// Labels for health check metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HealthCheckLabels {
    pub cluster: String,
    pub node: String,
    pub result: HealthCheckResult,
}

/// Result of a health check.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum HealthCheckResult {
    Success,
    Failure,
}

/// Labels for health transition metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TransitionLabels {
    pub cluster: String,
    pub node: String,
    pub to: HealthLabel,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum HealthLabel {
    Good,
    Bad,
}

/// Labels for frontend metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FrontendLabels {
    pub frontend: String,
}

/// Collects and stores all metrics.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<MetricsCollectorInner>,
}

struct MetricsCollectorInner {
    /// Node health gauge (1 = GOOD, 0 = BAD).
    node_health: Family<NodeLabels, Gauge>,
    /// Active connections gauge.
    active_connections: Family<NodeLabels, Gauge>,
    /// Admitted connections counter.
    connections_total: Family<NodeLabels, Counter>,
    /// Admissions refused at the connection cap.
    capacity_rejections: Family<NodeLabels, Counter>,
    /// Times each node was picked.
    selections_total: Family<NodeLabels, Counter>,
    /// Picks that found no GOOD node.
    no_backend_total: Family<ClusterLabels, Counter>,
    /// Bytes transferred counter.
    bytes_total: Family<BytesLabels, Counter>,
    /// Health check results counter.
    health_checks_total: Family<HealthCheckLabels, Counter>,
    /// Health state changes.
    health_transitions_total: Family<TransitionLabels, Counter>,
    /// Datagrams dropped because a flow's backlog was full.
    backlog_drops_total: Family<FrontendLabels, Counter>,
    /// Session duration histogram (in seconds).
    session_duration_seconds: Family<ClusterLabels, Histogram>,
    /// The prometheus registry.
    registry: Registry,
}

impl MetricsCollector {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let node_health = Family::<NodeLabels, Gauge>::default();
        let active_connections = Family::<NodeLabels, Gauge>::default();
        let connections_total = Family::<NodeLabels, Counter>::default();
        let capacity_rejections = Family::<NodeLabels, Counter>::default();
        let selections_total = Family::<NodeLabels, Counter>::default();
        let no_backend_total = Family::<ClusterLabels, Counter>::default();
        let bytes_total = Family::<BytesLabels, Counter>::default();
        let health_checks_total = Family::<HealthCheckLabels, Counter>::default();
        let health_transitions_total = Family::<TransitionLabels, Counter>::default();
        let backlog_drops_total = Family::<FrontendLabels, Counter>::default();
        let session_duration_seconds =
            Family::<ClusterLabels, Histogram>::new_with_constructor(|| {
                // Buckets: 1ms up to ~4.6h
                Histogram::new(exponential_buckets(0.001, 4.0, 13))
            });

        registry.register(
            "lbpool_node_health",
            "Node health status (1=GOOD, 0=BAD)",
            node_health.clone(),
        );
        registry.register(
            "lbpool_active_connections",
            "Number of active connections per node",
            active_connections.clone(),
        );
        registry.register(
            "lbpool_connections",
            "Total number of admitted connections",
            connections_total.clone(),
        );
        registry.register(
            "lbpool_capacity_rejections",
            "Connections refused because the node was at its cap",
            capacity_rejections.clone(),
        );
        registry.register(
            "lbpool_selections",
            "Times a node was picked for a request",
            selections_total.clone(),
        );
        registry.register(
            "lbpool_no_backend",
            "Picks that found no GOOD node",
            no_backend_total.clone(),
        );
        registry.register(
            "lbpool_bytes",
            "Total bytes transferred",
            bytes_total.clone(),
        );
        registry.register(
            "lbpool_health_checks",
            "Total number of health checks performed",
            health_checks_total.clone(),
        );
        registry.register(
            "lbpool_health_transitions",
            "Node health state changes",
            health_transitions_total.clone(),
        );
        registry.register(
            "lbpool_udp_backlog_drops",
            "Datagrams dropped because a flow backlog was full",
            backlog_drops_total.clone(),
        );
        registry.register(
            "lbpool_session_duration_seconds",
            "Proxied session duration in seconds",
            session_duration_seconds.clone(),
        );

        Self {
            inner: Arc::new(MetricsCollectorInner {
                node_health,
                active_connections,
                connections_total,
                capacity_rejections,
                selections_total,
                no_backend_total,
                bytes_total,
                health_checks_total,
                health_transitions_total,
                backlog_drops_total,
                session_duration_seconds,
                registry,
            }),
        }
    }

    /// Get the prometheus registry for encoding.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Update node health status.
    pub fn set_node_health(&self, cluster: &str, node: SocketAddr, health: NodeHealth) {
        self.inner
            .node_health
            .get_or_create(&NodeLabels::new(cluster, node))
            .set(i64::from(health == NodeHealth::Good));
    }

    /// Drop every series for a node that left its cluster.
    pub fn remove_node(&self, cluster: &str, node: SocketAddr) {
        let labels = NodeLabels::new(cluster, node);
        self.inner.node_health.remove(&labels);
        self.inner.active_connections.remove(&labels);
    }

    /// Record a node being picked.
    pub fn record_selection(&self, cluster: &str, node: SocketAddr) {
        self.inner
            .selections_total
            .get_or_create(&NodeLabels::new(cluster, node))
            .inc();
    }

    /// Record a pick that found no eligible node.
    pub fn record_no_backend(&self, cluster: &str) {
        self.inner
            .no_backend_total
            .get_or_create(&ClusterLabels {
                cluster: cluster.to_string(),
            })
            .inc();
    }

    /// Increment active connections.
    pub fn connection_opened(&self, cluster: &str, node: SocketAddr) {
        let labels = NodeLabels::new(cluster, node);
        self.inner.active_connections.get_or_create(&labels).inc();
        self.inner.connections_total.get_or_create(&labels).inc();
    }

    /// Decrement active connections and record how long the session ran.
    pub fn connection_closed(&self, cluster: &str, node: SocketAddr, duration: Duration) {
        self.inner
            .active_connections
            .get_or_create(&NodeLabels::new(cluster, node))
            .dec();
        self.inner
            .session_duration_seconds
            .get_or_create(&ClusterLabels {
                cluster: cluster.to_string(),
            })
            .observe(duration.as_secs_f64());
    }

    /// Record an admission refused at the node's cap.
    pub fn record_capacity_rejection(&self, cluster: &str, node: SocketAddr) {
        self.inner
            .capacity_rejections
            .get_or_create(&NodeLabels::new(cluster, node))
            .inc();
    }

    /// Record bytes moved to or from a node.
    pub fn record_bytes(&self, cluster: &str, node: SocketAddr, direction: Direction, bytes: u64) {
        if bytes == 0 {
            return;
        }
        let labels = BytesLabels {
            cluster: cluster.to_string(),
            node: node.to_string(),
            direction: direction.into(),
        };
        self.inner.bytes_total.get_or_create(&labels).inc_by(bytes);
    }

    /// Record a health check result.
    pub fn record_health_check(&self, cluster: &str, node: SocketAddr, success: bool) {
        let labels = HealthCheckLabels {
            cluster: cluster.to_string(),
            node: node.to_string(),
            result: if success {
                HealthCheckResult::Success
            } else {
                HealthCheckResult::Failure
            },
        };
        self.inner.health_checks_total.get_or_create(&labels).inc();
    }

    /// Record a health state change.
    pub fn record_health_transition(&self, cluster: &str, node: SocketAddr, to: NodeHealth) {
        let labels = TransitionLabels {
            cluster: cluster.to_string(),
            node: node.to_string(),
            to: match to {
                NodeHealth::Good => HealthLabel::Good,
                NodeHealth::Bad => HealthLabel::Bad,
            },
        };
        self.inner.health_transitions_total.get_or_create(&labels).inc();
        self.set_node_health(cluster, node, to);
    }

    /// Record a datagram dropped at a full backlog.
    pub fn record_backlog_drop(&self, frontend: &str) {
        self.inner
            .backlog_drops_total
            .get_or_create(&FrontendLabels {
                frontend: frontend.to_string(),
            })
            .inc();
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
