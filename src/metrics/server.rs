//! Prometheus metrics HTTP server.
//!
//! Serves the metrics registry, a liveness probe and a plain-text pool
//! status table.

use crate::backend::{ClusterRegistry, ClusterStatus};
use crate::metrics::MetricsCollector;
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus_client::encoding::text::encode;
use std::convert::Infallible;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

struct Endpoints {
    metrics_path: String,
    collector: MetricsCollector,
    registry: Arc<ClusterRegistry>,
}

/// Prometheus metrics HTTP server.
pub struct MetricsServer {
    listener: TcpListener,
    endpoints: Arc<Endpoints>,
}

impl MetricsServer {
    /// Bind the metrics listener.
    pub async fn bind(
        address: SocketAddr,
        path: String,
        collector: MetricsCollector,
        registry: Arc<ClusterRegistry>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self {
            listener,
            endpoints: Arc::new(Endpoints {
                metrics_path: path,
                collector,
                registry,
            }),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve requests until shutdown.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        match self.listener.local_addr() {
            Ok(address) => info!(address = %address, path = %self.endpoints.metrics_path, "metrics server started"),
            Err(e) => error!(error = %e, "metrics server has no local address"),
        }

        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, _addr)) => {
                            let endpoints = Arc::clone(&self.endpoints);

                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let endpoints = Arc::clone(&endpoints);
                                    async move { handle_request(req, &endpoints).await }
                                });

                                if let Err(e) = http1::Builder::new()
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!(error = %e, "metrics connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept metrics connection");
                        }
                    }
                }

                _ = shutdown.recv() => {
                    info!("metrics server shutting down");
                    break;
                }
            }
        }
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    endpoints: &Endpoints,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path();
    let method = req.method();

    debug!(path = %path, method = %method, "metrics request");

    if method != Method::GET {
        return Ok(text(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed\n".into()));
    }

    let response = if path == endpoints.metrics_path {
        let mut buffer = String::new();
        match encode(&mut buffer, endpoints.collector.registry()) {
            Ok(()) => {
                let mut response = text(StatusCode::OK, buffer);
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static(EXPOSITION_CONTENT_TYPE));
                response
            }
            Err(e) => {
                error!(error = %e, "failed to encode metrics");
                text(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics\n".into())
            }
        }
    } else if path == "/health" || path == "/healthz" {
        text(StatusCode::OK, "OK\n".into())
    } else if path == "/status" {
        text(StatusCode::OK, render_status(&endpoints.registry.status()))
    } else if path == "/" {
        text(
            StatusCode::OK,
            format!(
                "lbpool\n\nEndpoints:\n  {} - Prometheus metrics\n  /health - Liveness\n  /status - Pool status\n",
                endpoints.metrics_path
            ),
        )
    } else {
        text(StatusCode::NOT_FOUND, "Not found\n".into())
    };
    Ok(response)
}

fn text(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

/// One block per cluster, one row per node.
pub fn render_status(clusters: &[ClusterStatus]) -> String {
    let mut out = String::new();
    for cluster in clusters {
        let online = cluster
            .nodes
            .iter()
            .filter(|n| n.health == crate::backend::NodeHealth::Good)
            .count();
        let _ = writeln!(
            out,
            "cluster {} algorithm={} persistence={} nodes={} online={}",
            cluster.name,
            cluster.algorithm,
            cluster.persistence,
            cluster.nodes.len(),
            online
        );
        let _ = writeln!(
            out,
            "  {:<24} {:>6} {:>6} {:>6} {:>10} {:>14} {:>14}",
            "NODE", "HEALTH", "WEIGHT", "ACTIVE", "TOTAL", "BYTES_IN", "BYTES_OUT"
        );
        for node in &cluster.nodes {
            let _ = writeln!(
                out,
                "  {:<24} {:>6} {:>6} {:>6} {:>10} {:>14} {:>14}",
                node.address.to_string(),
                node.health.to_string(),
                node.weight,
                node.active_connections,
                node.total_connections,
                node.bytes_received,
                node.bytes_sent
            );
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{NodeHealth, NodeStatus};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[test]
    fn test_render_status() {
        let status = vec![ClusterStatus {
            name: "web".to_string(),
            algorithm: "round_robin",
            persistence: "none",
            nodes: vec![NodeStatus {
                address: "10.0.0.1:80".parse().unwrap(),
                weight: 2,
                max_connections: -1,
                health: NodeHealth::Good,
                active_connections: 3,
                total_connections: 10,
                bytes_received: 100,
                bytes_sent: 50,
            }],
        }];

        let rendered = render_status(&status);
        assert!(rendered.starts_with("cluster web algorithm=round_robin persistence=none nodes=1 online=1"));
        assert!(rendered.contains("10.0.0.1:80"));
        assert!(rendered.contains("GOOD"));
    }

    #[tokio::test]
    async fn test_serves_endpoints() {
        let collector = MetricsCollector::new();
        collector.record_no_backend("web");
        let registry = Arc::new(ClusterRegistry::new(collector.clone()));

        let server = MetricsServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            "/metrics".to_string(),
            collector,
            registry,
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        let (tx, rx) = broadcast::channel(1);
        let task = tokio::spawn(server.run(rx));

        let metrics = get(addr, "/metrics").await;
        assert!(metrics.starts_with("HTTP/1.1 200"));
        assert!(metrics.contains("lbpool_no_backend_total"));

        assert!(get(addr, "/health").await.ends_with("OK\n"));
        assert!(get(addr, "/status").await.starts_with("HTTP/1.1 200"));
        assert!(get(addr, "/missing").await.starts_with("HTTP/1.1 404"));

        tx.send(()).unwrap();
        task.await.unwrap();
    }
}
