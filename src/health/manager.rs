//! Per-node health check scheduling.
//!
//! Every node of a cluster gets its own probe task. The task awaits each
//! probe before waiting for the next tick, so a node never has two probes in
//! flight, and ticks missed during a slow probe are skipped.

use crate::backend::{BackendError, BackendResult, Node, NodeHealth};
use crate::config::HealthCheckSettings;
use crate::health::checker::{ProbeError, probe};
use crate::health::state::HealthTracker;
use crate::metrics::MetricsCollector;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

/// Buffered health events per subscriber before the slowest one lags.
const EVENT_CAPACITY: usize = 1024;

/// Floor for the probe period; a zero interval would spin.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// A node changed health state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthEvent {
    pub cluster: String,
    pub node: SocketAddr,
    pub from: NodeHealth,
    pub to: NodeHealth,
}

struct ProbeTask {
    handle: JoinHandle<()>,
    // Held while a transition is applied; set once the check is stopped.
    stopped: Arc<Mutex<bool>>,
}

impl ProbeTask {
    fn cancel(self) -> JoinHandle<()> {
        *self.stopped.lock() = true;
        self.handle.abort();
        self.handle
    }
}

/// Schedules and supervises one recurring probe per node.
pub struct HealthCheckManager {
    cluster: String,
    settings: HealthCheckSettings,
    tasks: DashMap<SocketAddr, ProbeTask>,
    events: broadcast::Sender<HealthEvent>,
    metrics: MetricsCollector,
}

impl HealthCheckManager {
    pub fn new(cluster: &str, settings: HealthCheckSettings, metrics: MetricsCollector) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            cluster: cluster.to_string(),
            settings,
            tasks: DashMap::new(),
            events,
            metrics,
        }
    }

    /// Settings every probe of this manager uses.
    pub fn settings(&self) -> &HealthCheckSettings {
        &self.settings
    }

    /// Receive every health transition from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    /// Number of nodes being probed.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Whether `address` has a running check.
    pub fn is_watching(&self, address: SocketAddr) -> bool {
        self.tasks.contains_key(&address)
    }

    /// Start probing `node`. The first probe runs immediately.
    ///
    /// Replaces any check already running for the same address. Requires a
    /// Tokio runtime.
    pub fn start(&self, node: Arc<Node>) -> BackendResult<()> {
        let runtime = Handle::try_current().map_err(|_| BackendError::RuntimeUnavailable)?;
        let address = node.address();
        let stopped = Arc::new(Mutex::new(false));

        self.metrics
            .set_node_health(&self.cluster, address, node.health());

        let probe_loop = ProbeLoop {
            cluster: self.cluster.clone(),
            node,
            settings: self.settings.clone(),
            stopped: Arc::clone(&stopped),
            events: self.events.clone(),
            metrics: self.metrics.clone(),
        };
        let handle = runtime.spawn(probe_loop.run());

        if let Some(previous) = self.tasks.insert(address, ProbeTask { handle, stopped }) {
            previous.cancel();
        }
        debug!(cluster = %self.cluster, node = %address, "health check started");
        Ok(())
    }

    /// Stop probing `address`. Idempotent; returns whether a check was running.
    ///
    /// Once this returns, the node's health is no longer changed.
    pub fn stop(&self, address: SocketAddr) -> bool {
        match self.tasks.remove(&address) {
            Some((_, task)) => {
                task.cancel();
                debug!(cluster = %self.cluster, node = %address, "health check stopped");
                true
            }
            None => false,
        }
    }

    /// Stop every check.
    pub fn stop_all(&self) {
        self.drain();
    }

    /// Stop every check and wait for the tasks to finish unwinding.
    pub async fn shutdown(&self) {
        let handles = self.drain();
        futures::future::join_all(handles).await;
    }

    fn drain(&self) -> Vec<JoinHandle<()>> {
        let addresses: Vec<SocketAddr> = self.tasks.iter().map(|entry| *entry.key()).collect();
        addresses
            .into_iter()
            .filter_map(|address| self.tasks.remove(&address))
            .map(|(_, task)| task.cancel())
            .collect()
    }
}

impl Drop for HealthCheckManager {
    fn drop(&mut self) {
        self.stop_all();
    }
}

struct ProbeLoop {
    cluster: String,
    node: Arc<Node>,
    settings: HealthCheckSettings,
    stopped: Arc<Mutex<bool>>,
    events: broadcast::Sender<HealthEvent>,
    metrics: MetricsCollector,
}

impl ProbeLoop {
    async fn run(self) {
        let address = self.node.address();
        let mut tracker = HealthTracker::new(
            self.settings.unhealthy_threshold,
            self.settings.healthy_threshold,
        );
        let mut ticker = interval(self.settings.interval.max(MIN_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let result = probe(address, &self.settings.kind, self.settings.timeout).await;
            if !self.apply(&mut tracker, result) {
                break;
            }
        }
    }

    /// Fold one probe result into the node's state. Returns false once the
    /// check has been stopped.
    fn apply(&self, tracker: &mut HealthTracker, result: Result<(), ProbeError>) -> bool {
        let address = self.node.address();
        let stopped = self.stopped.lock();
        if *stopped {
            return false;
        }

        self.metrics
            .record_health_check(&self.cluster, address, result.is_ok());
        let transition = match result {
            Ok(()) => {
                debug!(cluster = %self.cluster, node = %address, "health check passed");
                tracker.record_success()
            }
            Err(e) => {
                debug!(cluster = %self.cluster, node = %address, error = %e, "health check failed");
                tracker.record_failure()
            }
        };

        let Some(transition) = transition else {
            return true;
        };

        self.node.set_health(transition.to);
        match transition.to {
            NodeHealth::Good => info!(cluster = %self.cluster, node = %address, "node marked GOOD"),
            NodeHealth::Bad => warn!(cluster = %self.cluster, node = %address, "node marked BAD"),
        }
        self.metrics
            .record_health_transition(&self.cluster, address, transition.to);

        // No subscribers is fine
        let _ = self.events.send(HealthEvent {
            cluster: self.cluster.clone(),
            node: address,
            from: transition.from,
            to: transition.to,
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProbeKind;
    use tokio::net::TcpListener;

    fn settings(interval_ms: u64) -> HealthCheckSettings {
        HealthCheckSettings {
            kind: ProbeKind::Tcp,
            interval: Duration::from_millis(interval_ms),
            timeout: Duration::from_millis(200),
            unhealthy_threshold: 1,
            healthy_threshold: 1,
        }
    }

    fn manager(interval_ms: u64) -> HealthCheckManager {
        HealthCheckManager::new("test", settings(interval_ms), MetricsCollector::new())
    }

    async fn next_event(rx: &mut broadcast::Receiver<HealthEvent>) -> HealthEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no health event")
            .unwrap()
    }

    #[test]
    fn test_start_requires_runtime() {
        let manager = manager(50);
        let node = Arc::new(Node::new("127.0.0.1:9001".parse().unwrap(), 1, -1).unwrap());
        assert_eq!(manager.start(node), Err(BackendError::RuntimeUnavailable));
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_probe_marks_node_good_then_bad() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let manager = manager(50);
        let mut events = manager.subscribe();
        let node = Arc::new(Node::new(addr, 1, -1).unwrap());
        assert_eq!(node.health(), NodeHealth::Bad);

        manager.start(Arc::clone(&node)).unwrap();
        let event = next_event(&mut events).await;
        assert_eq!(event.node, addr);
        assert_eq!((event.from, event.to), (NodeHealth::Bad, NodeHealth::Good));
        assert!(node.is_online());

        accept.abort();
        let _ = accept.await;
        let event = next_event(&mut events).await;
        assert_eq!((event.from, event.to), (NodeHealth::Good, NodeHealth::Bad));
        assert!(!node.is_online());

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_slow_check_does_not_overlap_next_tick() {
        // Accepts and never answers, so every HTTP probe runs to its timeout
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&accepted);
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                log.lock().push(std::time::Instant::now());
                held.push(stream);
            }
        });

        let timeout = Duration::from_millis(300);
        let settings = HealthCheckSettings {
            kind: ProbeKind::Http {
                path: "/".to_string(),
            },
            interval: Duration::from_millis(20),
            timeout,
            unhealthy_threshold: 1,
            healthy_threshold: 1,
        };
        let manager = HealthCheckManager::new("slow", settings, MetricsCollector::new());
        let node = Arc::new(Node::new(addr, 1, -1).unwrap());
        manager.start(Arc::clone(&node)).unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;
        manager.shutdown().await;
        server.abort();

        // One connection at a time: each probe starts only after the previous
        // one timed out, not on every 20ms tick
        let accepted = accepted.lock().clone();
        assert!(accepted.len() >= 2, "{} probes", accepted.len());
        assert!(accepted.len() <= 4, "{} probes", accepted.len());
        for pair in accepted.windows(2) {
            assert!(pair[1] - pair[0] >= timeout - Duration::from_millis(20));
        }
        assert_eq!(node.health(), NodeHealth::Bad);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let manager = manager(50);
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let node = Arc::new(Node::new(addr, 1, -1).unwrap());

        manager.start(node).unwrap();
        assert!(manager.is_watching(addr));
        assert!(manager.stop(addr));
        assert!(!manager.stop(addr));
        assert!(!manager.is_watching(addr));
    }

    #[tokio::test]
    async fn test_no_transitions_after_stop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let manager = manager(20);
        let mut events = manager.subscribe();
        let node = Arc::new(Node::new(addr, 1, -1).unwrap());
        manager.start(Arc::clone(&node)).unwrap();
        next_event(&mut events).await;

        manager.stop(addr);
        drop(listener);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(events.try_recv().is_err());
        assert_eq!(node.health(), NodeHealth::Good);
    }

    #[tokio::test]
    async fn test_shutdown_stops_all() {
        let manager = manager(1000);
        for port in 9001..9005 {
            let node = Arc::new(Node::new(SocketAddr::from(([127, 0, 0, 1], port)), 1, -1).unwrap());
            manager.start(node).unwrap();
        }
        assert_eq!(manager.len(), 4);

        manager.shutdown().await;
        assert!(manager.is_empty());
    }
}
