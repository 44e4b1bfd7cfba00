//! UDP frontend.
//!
//! Keeps one flow per client address. The first datagram from a client picks
//! a node and opens a PENDING flow whose backend socket is set up in the
//! background; later datagrams queue in the flow's backlog until it is ready.

use crate::backend::{BackendError, ClusterRegistry, Direction, RequestIdentity};
use crate::config::{FrontendConfig, UdpConfig};
use crate::metrics::MetricsCollector;
use crate::proxy::{FlowState, FlowTable, Forwarded, MAX_DATAGRAM, UdpConnection, UdpProxyError};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

/// UDP frontend bound to one socket.
pub struct DatagramFrontend {
    config: FrontendConfig,
    udp: UdpConfig,
    registry: Arc<ClusterRegistry>,
    socket: Arc<UdpSocket>,
    flows: Arc<FlowTable>,
    metrics: MetricsCollector,
}

impl DatagramFrontend {
    /// Bind the frontend's listen address.
    pub async fn bind(
        config: FrontendConfig,
        registry: Arc<ClusterRegistry>,
        metrics: MetricsCollector,
    ) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(config.listen).await?;
        let udp = config.udp.clone().unwrap_or_default();

        info!(
            name = %config.name,
            listen = %socket.local_addr()?,
            cluster = %config.cluster,
            backlog_limit = udp.backlog_limit,
            "udp frontend bound"
        );

        Ok(Self {
            config,
            udp,
            registry,
            socket: Arc::new(socket),
            flows: Arc::new(FlowTable::new()),
            metrics,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Live flows, shared with the reaper.
    pub fn flows(&self) -> &Arc<FlowTable> {
        &self.flows
    }

    /// Receive datagrams until shutdown, then close every flow.
    #[instrument(skip_all, fields(frontend = %self.config.name))]
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!("udp frontend starting");

        let reaper = tokio::spawn(run_reaper(
            Arc::clone(&self.flows),
            self.udp.clone(),
            self.config.cluster.clone(),
            self.metrics.clone(),
            shutdown.resubscribe(),
        ));

        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((n, client)) => {
                            self.handle_datagram(Bytes::copy_from_slice(&buf[..n]), client).await;
                        }
                        Err(e) => {
                            error!(error = %e, "failed to receive datagram");
                        }
                    }
                }

                _ = shutdown.recv() => {
                    info!("udp frontend shutting down");
                    break;
                }
            }
        }

        let _ = reaper.await;
        for flow in self.flows.close_all().await {
            record_flow_end(&self.metrics, &self.config.cluster, &flow);
        }
    }

    async fn handle_datagram(&self, datagram: Bytes, client: SocketAddr) {
        let flow = match self.flow_for(client) {
            Ok(flow) => flow,
            Err(UdpProxyError::Backend(e)) if e.is_recoverable() => {
                debug!(client = %client, error = %e, "datagram rejected");
                return;
            }
            Err(e) => {
                warn!(client = %client, error = %e, "failed to open flow");
                return;
            }
        };

        match flow.forward(datagram).await {
            Ok(Forwarded::Dropped) => self.metrics.record_backlog_drop(&self.config.name),
            Ok(_) => {}
            Err(e) => debug!(client = %client, error = %e, "datagram not forwarded"),
        }
    }

    /// The live flow for `client`, opening one if needed.
    fn flow_for(&self, client: SocketAddr) -> Result<Arc<UdpConnection>, UdpProxyError> {
        if let Some(flow) = self.flows.get(client) {
            if flow.state() != FlowState::Closed {
                return Ok(flow);
            }
            if self.flows.remove(&flow) {
                record_flow_end(&self.metrics, &self.config.cluster, &flow);
            }
        }

        let cluster = self.config.cluster.as_str();
        let local = self.socket.local_addr().unwrap_or(self.config.listen);
        let request = RequestIdentity::new(client).with_destination(local);
        let node = self.registry.pick(cluster, &request)?;
        let guard = match node.try_acquire() {
            Ok(guard) => guard,
            Err(e) => {
                if let BackendError::CapacityExceeded(..) = e {
                    self.metrics.record_capacity_rejection(cluster, node.address());
                }
                return Err(e.into());
            }
        };

        let (flow, inserted) = self
            .flows
            .insert(UdpConnection::new(client, guard, self.udp.backlog_limit));
        if inserted {
            self.metrics.connection_opened(cluster, node.address());
            debug!(client = %client, backend = %node.address(), "flow opened");
            self.spawn_connect(Arc::clone(&flow));
        }
        Ok(flow)
    }

    fn spawn_connect(&self, flow: Arc<UdpConnection>) {
        let frontend = Arc::clone(&self.socket);
        let connect_timeout = self.udp.connect_timeout;
        tokio::spawn(async move {
            match flow.connect(connect_timeout).await {
                Ok(backend) => flow.spawn_reply_relay(backend, frontend),
                Err(e) => {
                    // The flow is CLOSED now; the reaper removes it
                    warn!(
                        client = %flow.client(),
                        backend = %flow.node().address(),
                        error = %e,
                        "backend connect failed"
                    );
                }
            }
        });
    }
}

/// Remove CLOSED and idle flows every `reap_interval` until shutdown.
async fn run_reaper(
    flows: Arc<FlowTable>,
    udp: UdpConfig,
    cluster: String,
    metrics: MetricsCollector,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(udp.reap_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let reaped = flows.reap(udp.idle_timeout).await;
                if !reaped.is_empty() {
                    debug!(reaped = reaped.len(), remaining = flows.len(), "reaped udp flows");
                }
                for flow in reaped {
                    record_flow_end(&metrics, &cluster, &flow);
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}

fn record_flow_end(metrics: &MetricsCollector, cluster: &str, flow: &UdpConnection) {
    let node = flow.node().address();
    metrics.connection_closed(cluster, node, flow.age());
    metrics.record_bytes(cluster, node, Direction::Sent, flow.bytes_to_backend());
    metrics.record_bytes(cluster, node, Direction::Received, flow.bytes_to_client());
}
