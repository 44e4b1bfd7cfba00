//! Shared application state.

use crate::backend::{BackendResult, ClusterRegistry};
use crate::config::Config;
use crate::metrics::MetricsCollector;
use crate::util::ShutdownSignal;
use arc_swap::ArcSwap;
use std::sync::Arc;
use tracing::info;

/// Shared state accessible from all tasks.
#[derive(Clone)]
pub struct AppState {
    /// Last configuration successfully applied to the registry.
    config: Arc<ArcSwap<Config>>,
    registry: Arc<ClusterRegistry>,
    metrics: MetricsCollector,
    shutdown: ShutdownSignal,
}

impl AppState {
    /// Build the registry from `config`. Must run inside a Tokio runtime.
    pub fn new(config: Config) -> BackendResult<Self> {
        let metrics = MetricsCollector::new();
        let registry = ClusterRegistry::from_config(&config, metrics.clone())?;
        Ok(Self {
            config: Arc::new(ArcSwap::from_pointee(config)),
            registry: Arc::new(registry),
            metrics,
            shutdown: ShutdownSignal::new(),
        })
    }

    /// Get the current configuration.
    pub fn config(&self) -> arc_swap::Guard<Arc<Config>> {
        self.config.load()
    }

    pub fn registry(&self) -> &Arc<ClusterRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn shutdown(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    /// Apply a new configuration to the registry, then publish it.
    ///
    /// The published config is left alone if the registry rejects it.
    pub fn reload(&self, config: Config) -> BackendResult<()> {
        self.registry.apply(&config)?;
        info!(clusters = self.registry.len(), "configuration applied");
        self.config.store(Arc::new(config));
        Ok(())
    }

    /// Signal every task, then stop all health checks.
    pub async fn stop(&self) {
        self.shutdown.trigger();
        self.registry.shutdown().await;
    }
}
