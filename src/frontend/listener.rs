//! TCP frontend listener.
//!
//! Accepts client connections, picks a node from the frontend's cluster and
//! proxies the stream to it.

use crate::backend::{BackendError, ClusterRegistry, Direction, RequestIdentity};
use crate::config::FrontendConfig;
use crate::metrics::MetricsCollector;
use crate::proxy::{TcpProxyError, handle_tcp_proxy};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

/// Frontend listener that accepts and handles TCP connections.
pub struct FrontendListener {
    config: FrontendConfig,
    registry: Arc<ClusterRegistry>,
    listener: TcpListener,
    metrics: MetricsCollector,
}

impl FrontendListener {
    /// Bind the frontend's listen address.
    pub async fn bind(
        config: FrontendConfig,
        registry: Arc<ClusterRegistry>,
        metrics: MetricsCollector,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(config.listen).await?;

        info!(
            name = %config.name,
            listen = %listener.local_addr()?,
            cluster = %config.cluster,
            "tcp frontend bound"
        );

        Ok(Self {
            config,
            registry,
            listener,
            metrics,
        })
    }

    /// Address actually bound, useful when listening on port 0.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the listener, accepting connections until shutdown.
    #[instrument(skip_all, fields(frontend = %self.config.name))]
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!("tcp frontend starting");

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                        }
                    }
                }

                _ = shutdown.recv() => {
                    info!("tcp frontend shutting down");
                    break;
                }
            }
        }
    }

    fn handle_connection(&self, stream: TcpStream, client_addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "failed to set TCP_NODELAY on client connection");
        }

        let local_addr = stream.local_addr().unwrap_or(self.config.listen);
        let cluster = self.config.cluster.clone();
        let connect_timeout = self.config.tcp.clone().unwrap_or_default().connect_timeout;
        let registry = Arc::clone(&self.registry);
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            let request = RequestIdentity::new(client_addr).with_destination(local_addr);
            let result = handle_tcp_connection(
                stream,
                &request,
                &cluster,
                &registry,
                connect_timeout,
                &metrics,
            )
            .await;

            match result {
                Ok(()) => {}
                Err(TcpProxyError::Backend(e)) if e.is_recoverable() => {
                    debug!(cluster = %cluster, client = %client_addr, error = %e, "connection rejected");
                }
                Err(e) => {
                    warn!(cluster = %cluster, client = %client_addr, error = %e, "connection handling failed");
                }
            }
        });
    }
}

/// Drive one client connection through pick, admission and proxy.
///
/// Dropping `client_stream` on any early return closes the client.
async fn handle_tcp_connection(
    client_stream: TcpStream,
    request: &RequestIdentity,
    cluster: &str,
    registry: &ClusterRegistry,
    connect_timeout: Duration,
    metrics: &MetricsCollector,
) -> Result<(), TcpProxyError> {
    let node = registry.pick(cluster, request)?;
    let backend = node.address();

    let guard = match node.try_acquire() {
        Ok(guard) => guard,
        Err(e) => {
            if let BackendError::CapacityExceeded(..) = e {
                metrics.record_capacity_rejection(cluster, backend);
            }
            return Err(e.into());
        }
    };

    metrics.connection_opened(cluster, backend);
    let start = Instant::now();
    let result = handle_tcp_proxy(client_stream, &guard, connect_timeout).await;
    let duration = start.elapsed();
    drop(guard);
    metrics.connection_closed(cluster, backend, duration);

    let proxy_result = result?;
    metrics.record_bytes(cluster, backend, Direction::Sent, proxy_result.bytes_to_backend);
    metrics.record_bytes(cluster, backend, Direction::Received, proxy_result.bytes_to_client);

    info!(
        client = %request.source(),
        backend = %backend,
        bytes_to_backend = proxy_result.bytes_to_backend,
        bytes_to_client = proxy_result.bytes_to_client,
        duration_ms = duration.as_millis(),
        "tcp session completed"
    );
    Ok(())
}
