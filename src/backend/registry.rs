//! Registry of the clusters served by one load balancer instance.

use crate::backend::cluster::{Cluster, ClusterOptions, ClusterStatus};
use crate::backend::error::{BackendError, BackendResult};
use crate::backend::node::Node;
use crate::backend::request::RequestIdentity;
use crate::config::{ClusterConfig, Config, HealthCheckDefaults, NodeConfig};
use crate::metrics::MetricsCollector;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info};

/// Owns every cluster by name.
///
/// Created at startup and torn down with [`shutdown`](Self::shutdown);
/// independent instances do not share anything.
pub struct ClusterRegistry {
    clusters: DashMap<String, Arc<Cluster>>,
    metrics: MetricsCollector,
}

impl ClusterRegistry {
    pub fn new(metrics: MetricsCollector) -> Self {
        Self {
            clusters: DashMap::new(),
            metrics,
        }
    }

    /// Build a registry holding every cluster in `config`.
    pub fn from_config(config: &Config, metrics: MetricsCollector) -> BackendResult<Self> {
        let registry = Self::new(metrics);
        registry.apply(config)?;
        Ok(registry)
    }

    /// Options for a cluster that records into this registry's metrics.
    pub fn options(&self) -> ClusterOptions {
        ClusterOptions {
            metrics: self.metrics.clone(),
            ..ClusterOptions::default()
        }
    }

    /// Register a new, empty cluster.
    pub fn create_cluster(&self, name: &str, options: ClusterOptions) -> BackendResult<Arc<Cluster>> {
        match self.clusters.entry(name.to_string()) {
            Entry::Occupied(_) => Err(BackendError::DuplicateCluster(name.to_string())),
            Entry::Vacant(slot) => {
                let cluster = Arc::new(Cluster::new(name, options));
                slot.insert(Arc::clone(&cluster));
                info!(cluster = %name, "cluster created");
                Ok(cluster)
            }
        }
    }

    /// Unregister a cluster and close it.
    pub fn remove_cluster(&self, name: &str) -> BackendResult<()> {
        let (_, cluster) = self
            .clusters
            .remove(name)
            .ok_or_else(|| BackendError::ClusterNotFound(name.to_string()))?;
        cluster.close();
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Cluster>> {
        self.clusters.get(name).map(|c| Arc::clone(c.value()))
    }

    /// Registered cluster names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clusters.iter().map(|c| c.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    /// Pick a node of `cluster` for `request`.
    pub fn pick(&self, cluster: &str, request: &RequestIdentity) -> BackendResult<Arc<Node>> {
        self.require(cluster)?.pick(request)
    }

    /// Add a node to `cluster`.
    pub fn add_node(&self, cluster: &str, node: Node) -> BackendResult<Arc<Node>> {
        self.require(cluster)?.add_node(node)
    }

    /// Remove a node from `cluster`; fails if it is not there.
    pub fn remove_node(&self, cluster: &str, address: SocketAddr) -> BackendResult<()> {
        if self.require(cluster)?.remove_node(address) {
            Ok(())
        } else {
            Err(BackendError::NodeNotFound(address, cluster.to_string()))
        }
    }

    /// Bring the registry in line with `config`.
    ///
    /// Clusters absent from `config` are closed and new ones created.
    /// Existing clusters keep their nodes and health state where nothing
    /// changed; a node whose weight or cap changed is replaced, and a cluster
    /// whose health check settings changed is rebuilt.
    ///
    /// Every node is built before anything is touched, so a config that
    /// fails with [`BackendError::InvalidConfiguration`] leaves the registry
    /// exactly as it was.
    pub fn apply(&self, config: &Config) -> BackendResult<()> {
        let staged = config
            .clusters
            .iter()
            .map(|c| self.stage(c, &config.health_check_defaults))
            .collect::<BackendResult<Vec<_>>>()?;
        if staged.iter().any(Staged::starts_checks) {
            tokio::runtime::Handle::try_current().map_err(|_| BackendError::RuntimeUnavailable)?;
        }

        let wanted: HashSet<&str> = config.clusters.iter().map(|c| c.name.as_str()).collect();
        for name in self.names() {
            if !wanted.contains(name.as_str()) {
                if let Some((_, cluster)) = self.clusters.remove(&name) {
                    cluster.close();
                }
            }
        }

        for staged in staged {
            self.commit(staged)?;
        }
        Ok(())
    }

    fn stage<'a>(
        &self,
        config: &'a ClusterConfig,
        defaults: &HealthCheckDefaults,
    ) -> BackendResult<Staged<'a>> {
        let options = ClusterOptions::from_config(config, defaults, self.metrics.clone());

        let mut seen = HashSet::new();
        for node in &config.nodes {
            if !seen.insert(node.address) {
                return Err(BackendError::InvalidConfiguration(format!(
                    "duplicate node {} in cluster '{}'",
                    node.address, config.name
                )));
            }
        }

        let plan = match self.get(&config.name) {
            Some(existing) if *existing.health().settings() == options.health => {
                let (remove, add) = node_changes(&existing, config)?;
                Plan::Reconcile {
                    cluster: existing,
                    remove,
                    add,
                }
            }
            previous => Plan::Build {
                previous,
                nodes: config
                    .nodes
                    .iter()
                    .map(Node::from_config)
                    .collect::<BackendResult<_>>()?,
            },
        };
        Ok(Staged {
            config,
            options,
            plan,
        })
    }

    fn commit(&self, staged: Staged<'_>) -> BackendResult<()> {
        let Staged {
            config,
            options,
            plan,
        } = staged;

        match plan {
            Plan::Reconcile {
                cluster,
                remove,
                add,
            } => {
                cluster.set_algorithm(config.algorithm);
                cluster.set_persistence(&config.persistence);
                for address in remove {
                    cluster.remove_node(address);
                }
                for node in add {
                    cluster.add_node(node)?;
                }
            }
            Plan::Build { previous, nodes } => {
                let cluster = Arc::new(Cluster::new(&config.name, options));
                for node in nodes {
                    cluster.add_node(node)?;
                }
                self.clusters.insert(config.name.clone(), cluster);
                match previous {
                    Some(previous) => {
                        debug!(cluster = %config.name, "health check settings changed, rebuilt");
                        previous.close();
                    }
                    None => info!(cluster = %config.name, "cluster created"),
                }
            }
        }
        Ok(())
    }

    /// Status of every cluster, sorted by name.
    pub fn status(&self) -> Vec<ClusterStatus> {
        let mut status: Vec<ClusterStatus> =
            self.clusters.iter().map(|c| c.value().status()).collect();
        status.sort_by(|a, b| a.name.cmp(&b.name));
        status
    }

    /// Close every cluster and wait for their health checks to stop.
    pub async fn shutdown(&self) {
        let clusters: Vec<Arc<Cluster>> = self
            .names()
            .into_iter()
            .filter_map(|name| self.clusters.remove(&name).map(|(_, c)| c))
            .collect();
        futures::future::join_all(clusters.iter().map(|c| c.shutdown())).await;
        info!(clusters = clusters.len(), "cluster registry shut down");
    }

    fn require(&self, name: &str) -> BackendResult<Arc<Cluster>> {
        self.get(name)
            .ok_or_else(|| BackendError::ClusterNotFound(name.to_string()))
    }
}

/// One cluster's worth of changes, fully built and not yet visible.
struct Staged<'a> {
    config: &'a ClusterConfig,
    options: ClusterOptions,
    plan: Plan,
}

impl Staged<'_> {
    fn starts_checks(&self) -> bool {
        match &self.plan {
            Plan::Reconcile { add, .. } => !add.is_empty(),
            Plan::Build { nodes, .. } => !nodes.is_empty(),
        }
    }
}

enum Plan {
    /// Update an existing cluster in place.
    Reconcile {
        cluster: Arc<Cluster>,
        remove: Vec<SocketAddr>,
        add: Vec<Node>,
    },
    /// Create the cluster from scratch, closing any previous one.
    Build {
        previous: Option<Arc<Cluster>>,
        nodes: Vec<Node>,
    },
}

/// Nodes to drop from `cluster` and replacement or new nodes to add.
fn node_changes(
    cluster: &Cluster,
    config: &ClusterConfig,
) -> BackendResult<(Vec<SocketAddr>, Vec<Node>)> {
    let wanted: HashMap<SocketAddr, &NodeConfig> =
        config.nodes.iter().map(|n| (n.address, n)).collect();
    let mut remove = Vec::new();
    let mut add = Vec::new();

    for node in cluster.nodes().iter() {
        match wanted.get(&node.address()) {
            None => remove.push(node.address()),
            Some(desired)
                if desired.weight != node.weight()
                    || desired.max_connections != node.max_connections() =>
            {
                add.push(Node::from_config(desired)?);
                remove.push(node.address());
            }
            Some(_) => {}
        }
    }

    for desired in &config.nodes {
        if cluster.node(desired.address).is_none() {
            add.push(Node::from_config(desired)?);
        }
    }
    Ok((remove, add))
}
