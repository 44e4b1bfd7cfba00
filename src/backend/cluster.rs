//! A cluster: the nodes behind one routing target and how to pick among them.

use crate::backend::algorithms::{self, LoadBalancer};
use crate::backend::error::{BackendError, BackendResult};
use crate::backend::node::{Node, NodeHealth};
use crate::backend::persistence::{self, SessionPersistence};
use crate::backend::request::RequestIdentity;
use crate::config::{
    Algorithm, ClusterConfig, HealthCheckDefaults, HealthCheckSettings, PersistenceConfig,
};
use crate::health::HealthCheckManager;
use crate::metrics::MetricsCollector;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// Everything needed to build a cluster apart from its nodes.
#[derive(Clone)]
pub struct ClusterOptions {
    pub algorithm: Algorithm,
    pub persistence: PersistenceConfig,
    pub health: HealthCheckSettings,
    pub metrics: MetricsCollector,
}

impl ClusterOptions {
    pub fn from_config(
        config: &ClusterConfig,
        defaults: &HealthCheckDefaults,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            algorithm: config.algorithm,
            persistence: config.persistence.clone(),
            health: config.health_check.resolve(defaults),
            metrics,
        }
    }
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::default(),
            persistence: PersistenceConfig::default(),
            health: HealthCheckSettings::default(),
            metrics: MetricsCollector::new(),
        }
    }
}

/// Point-in-time view of one node, for status output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub address: SocketAddr,
    pub weight: u32,
    pub max_connections: i64,
    pub health: NodeHealth,
    pub active_connections: u32,
    pub total_connections: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

/// Point-in-time view of one cluster, for status output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterStatus {
    pub name: String,
    pub algorithm: &'static str,
    pub persistence: &'static str,
    pub nodes: Vec<NodeStatus>,
}

/// The set of nodes for one routing target plus its selection policy.
///
/// Readers (`pick`, `online_nodes`) work on an immutable snapshot of the
/// node list and never block. Membership changes build a new list under a
/// writer lock and publish it atomically.
pub struct Cluster {
    name: String,
    nodes: ArcSwap<Vec<Arc<Node>>>,
    membership: Mutex<()>,
    algorithm: ArcSwap<Box<dyn LoadBalancer>>,
    persistence: ArcSwap<Box<dyn SessionPersistence>>,
    // Settings the current strategy and persistence layer were built from
    policy: Mutex<(Algorithm, PersistenceConfig)>,
    health: HealthCheckManager,
    metrics: MetricsCollector,
    closed: AtomicBool,
}

impl Cluster {
    /// Create an empty cluster.
    pub fn new(name: impl Into<String>, options: ClusterOptions) -> Self {
        let name = name.into();
        let health = HealthCheckManager::new(&name, options.health, options.metrics.clone());
        Self {
            nodes: ArcSwap::from_pointee(Vec::new()),
            membership: Mutex::new(()),
            algorithm: ArcSwap::from_pointee(algorithms::build(options.algorithm)),
            persistence: ArcSwap::from_pointee(persistence::build(&options.persistence)),
            policy: Mutex::new((options.algorithm, options.persistence)),
            health,
            metrics: options.metrics,
            closed: AtomicBool::new(false),
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The health check manager probing this cluster's nodes.
    pub fn health(&self) -> &HealthCheckManager {
        &self.health
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Add a node and start its health check.
    ///
    /// The node stays BAD, and so ineligible, until its first probe
    /// succeeds. Fails with [`BackendError::DuplicateNode`] if a node with the
    /// same address is already present.
    pub fn add_node(&self, node: Node) -> BackendResult<Arc<Node>> {
        let _guard = self.membership.lock();
        if self.is_closed() {
            return Err(BackendError::ClusterClosed(self.name.clone()));
        }

        let current = self.nodes.load();
        if current.iter().any(|n| n.address() == node.address()) {
            return Err(BackendError::DuplicateNode(node.address(), self.name.clone()));
        }

        let node = Arc::new(node);
        self.health.start(Arc::clone(&node))?;

        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().cloned());
        next.push(Arc::clone(&node));
        self.nodes.store(Arc::new(next));

        info!(cluster = %self.name, node = %node.address(), weight = node.weight(), "node added");
        Ok(node)
    }

    /// Remove a node, stopping its health check first.
    ///
    /// Returns whether the node was present.
    pub fn remove_node(&self, address: SocketAddr) -> bool {
        let _guard = self.membership.lock();

        let current = self.nodes.load();
        if !current.iter().any(|n| n.address() == address) {
            return false;
        }

        self.health.stop(address);
        let next: Vec<Arc<Node>> = current
            .iter()
            .filter(|n| n.address() != address)
            .cloned()
            .collect();
        self.nodes.store(Arc::new(next));

        self.persistence.load().forget(address);
        self.metrics.remove_node(&self.name, address);
        info!(cluster = %self.name, node = %address, "node removed");
        true
    }

    /// The node with `address`, if present.
    pub fn node(&self, address: SocketAddr) -> Option<Arc<Node>> {
        self.nodes
            .load()
            .iter()
            .find(|n| n.address() == address)
            .cloned()
    }

    /// Snapshot of every node, in insertion order.
    pub fn nodes(&self) -> Arc<Vec<Arc<Node>>> {
        self.nodes.load_full()
    }

    /// Snapshot of the GOOD nodes, in insertion order.
    pub fn online_nodes(&self) -> Vec<Arc<Node>> {
        self.nodes
            .load()
            .iter()
            .filter(|n| n.is_online())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.load().is_empty()
    }

    /// Pick a node for `request`.
    ///
    /// A live persistence mapping to a GOOD node wins. Otherwise the
    /// algorithm chooses among the GOOD nodes and the choice is remembered
    /// for the request's identity.
    pub fn pick(&self, request: &RequestIdentity) -> BackendResult<Arc<Node>> {
        if self.is_closed() {
            return Err(BackendError::ClusterClosed(self.name.clone()));
        }

        let nodes = self.nodes.load();
        let persistence = self.persistence.load();

        if let Some(bound) = persistence.resolve(request) {
            if let Some(node) = nodes.iter().find(|n| n.address() == bound && n.is_online()) {
                self.metrics.record_selection(&self.name, bound);
                return Ok(Arc::clone(node));
            }
            debug!(cluster = %self.name, node = %bound, "persisted node unavailable, re-selecting");
        }

        let online: Vec<Arc<Node>> = nodes.iter().filter(|n| n.is_online()).cloned().collect();
        let Some(node) = self.algorithm.load().select(&online, request) else {
            self.metrics.record_no_backend(&self.name);
            debug!(cluster = %self.name, client = %request.source(), "no backend available");
            return Err(BackendError::NoBackendAvailable(self.name.clone()));
        };

        persistence.bind(request, node.address());
        self.metrics.record_selection(&self.name, node.address());
        Ok(node)
    }

    /// Swap in a fresh instance of `algorithm`, unless it is already in use.
    ///
    /// Returns whether the strategy changed.
    pub fn set_algorithm(&self, algorithm: Algorithm) -> bool {
        let mut policy = self.policy.lock();
        if policy.0 == algorithm {
            return false;
        }
        let strategy = algorithms::build(algorithm);
        info!(cluster = %self.name, algorithm = strategy.name(), "algorithm changed");
        self.algorithm.store(Arc::new(strategy));
        policy.0 = algorithm;
        true
    }

    /// Swap the persistence layer, unless `config` is already in use.
    /// Existing mappings are dropped.
    ///
    /// Returns whether the layer changed.
    pub fn set_persistence(&self, config: &PersistenceConfig) -> bool {
        let mut policy = self.policy.lock();
        if policy.1 == *config {
            return false;
        }
        let layer = persistence::build(config);
        info!(cluster = %self.name, persistence = layer.name(), "persistence changed");
        self.persistence.store(Arc::new(layer));
        policy.1 = config.clone();
        true
    }

    pub fn algorithm_name(&self) -> &'static str {
        self.algorithm.load().name()
    }

    pub fn persistence_name(&self) -> &'static str {
        self.persistence.load().name()
    }

    pub fn status(&self) -> ClusterStatus {
        ClusterStatus {
            name: self.name.clone(),
            algorithm: self.algorithm_name(),
            persistence: self.persistence_name(),
            nodes: self
                .nodes
                .load()
                .iter()
                .map(|n| NodeStatus {
                    address: n.address(),
                    weight: n.weight(),
                    max_connections: n.max_connections(),
                    health: n.health(),
                    active_connections: n.active_connections(),
                    total_connections: n.total_connections(),
                    bytes_received: n.bytes_received(),
                    bytes_sent: n.bytes_sent(),
                })
                .collect(),
        }
    }

    /// Stop every health check and drop all nodes. Idempotent.
    pub fn close(&self) {
        if self.mark_closed() {
            self.health.stop_all();
        }
    }

    /// Like [`close`](Self::close), but waits for the probe tasks to finish.
    pub async fn shutdown(&self) {
        self.mark_closed();
        self.health.shutdown().await;
    }

    fn mark_closed(&self) -> bool {
        let _guard = self.membership.lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        let nodes = self.nodes.swap(Arc::new(Vec::new()));
        for node in nodes.iter() {
            self.metrics.remove_node(&self.name, node.address());
        }
        self.persistence.load().clear();
        info!(cluster = %self.name, nodes = nodes.len(), "cluster closed");
        true
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("name", &self.name)
            .field("algorithm", &self.algorithm_name())
            .field("persistence", &self.persistence_name())
            .field("nodes", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
