//! Active health probes.
//!
//! A probe either opens a TCP connection to the node or issues a minimal
//! HTTP/1.1 `GET` and inspects the status line.

use crate::config::ProbeKind;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Largest status-line prefix read from an HTTP health endpoint.
const MAX_RESPONSE_HEAD: usize = 1024;

/// Why a single probe failed. Never surfaced past the health subsystem.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("connection failed: {0}")]
    Connect(#[source] std::io::Error),

    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("unexpected status: {0}")]
    Status(u16),
}

/// Run one probe of `kind` against `target`, bounded by `limit` overall.
pub async fn probe(target: SocketAddr, kind: &ProbeKind, limit: Duration) -> Result<(), ProbeError> {
    let attempt = async {
        match kind {
            ProbeKind::Tcp => tcp_health_check(target).await,
            ProbeKind::Http { path } => http_health_check(target, path).await,
        }
    };

    timeout(limit, attempt)
        .await
        .map_err(|_| ProbeError::Timeout(limit))?
}

/// Perform a TCP health check (just connect).
async fn tcp_health_check(target: SocketAddr) -> Result<(), ProbeError> {
    let _stream = TcpStream::connect(target)
        .await
        .map_err(ProbeError::Connect)?;
    Ok(())
}

/// Perform an HTTP health check; any 2xx status passes.
async fn http_health_check(target: SocketAddr, path: &str) -> Result<(), ProbeError> {
    let mut stream = TcpStream::connect(target)
        .await
        .map_err(ProbeError::Connect)?;

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: lbpool-health\r\nConnection: close\r\n\r\n",
        path, target
    );
    stream.write_all(request.as_bytes()).await?;

    // Read until the status line is complete
    let mut buf = vec![0u8; MAX_RESPONSE_HEAD];
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
        if buf[..filled].contains(&b'\n') {
            break;
        }
    }
    if filled == 0 {
        return Err(ProbeError::MalformedResponse("empty response".to_string()));
    }

    let response = String::from_utf8_lossy(&buf[..filled]);
    let status = parse_http_status(&response)?;

    if (200..300).contains(&status) {
        Ok(())
    } else {
        Err(ProbeError::Status(status))
    }
}

/// Parse HTTP status code from response.
fn parse_http_status(response: &str) -> Result<u16, ProbeError> {
    // Format: "HTTP/1.1 200 OK\r\n..."
    let mut parts = response.split_whitespace();
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(ProbeError::MalformedResponse(
            "missing HTTP version".to_string(),
        ));
    }

    parts
        .next()
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| ProbeError::MalformedResponse("invalid status code".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn http_server(reply: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 512];
                let _ = stream.read(&mut buf).await;
                let _ = stream.write_all(reply.as_bytes()).await;
            }
        });
        addr
    }

    #[test]
    fn test_parse_http_status() {
        assert_eq!(parse_http_status("HTTP/1.1 200 OK\r\n").unwrap(), 200);
        assert_eq!(parse_http_status("HTTP/1.0 404 Not Found\r\n").unwrap(), 404);
        assert_eq!(parse_http_status("HTTP/1.1 503 Service Unavailable").unwrap(), 503);
    }

    #[test]
    fn test_parse_http_status_invalid() {
        assert!(parse_http_status("invalid").is_err());
        assert!(parse_http_status("").is_err());
        assert!(parse_http_status("HTTP/1.1 abc").is_err());
    }

    #[tokio::test]
    async fn test_tcp_probe_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let result = probe(addr, &ProbeKind::Tcp, Duration::from_secs(5)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_tcp_probe_refused() {
        // Bind then drop to find a port nobody listens on
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let result = probe(addr, &ProbeKind::Tcp, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ProbeError::Connect(_))));
    }

    #[tokio::test]
    async fn test_http_probe_accepts_any_2xx() {
        let kind = ProbeKind::Http {
            path: "/healthz".to_string(),
        };
        for reply in [
            "HTTP/1.1 200 OK\r\n\r\n",
            "HTTP/1.1 204 No Content\r\n\r\n",
        ] {
            let addr = http_server(reply).await;
            assert!(probe(addr, &kind, Duration::from_secs(2)).await.is_ok(), "{reply}");
        }
    }

    #[tokio::test]
    async fn test_http_probe_rejects_non_2xx() {
        let kind = ProbeKind::Http {
            path: "/".to_string(),
        };
        let addr = http_server("HTTP/1.1 503 Service Unavailable\r\n\r\n").await;
        let result = probe(addr, &kind, Duration::from_secs(2)).await;
        assert!(matches!(result, Err(ProbeError::Status(503))));

        let addr = http_server("HTTP/1.1 301 Moved Permanently\r\n\r\n").await;
        let result = probe(addr, &kind, Duration::from_secs(2)).await;
        assert!(matches!(result, Err(ProbeError::Status(301))));
    }

    #[tokio::test]
    async fn test_http_probe_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // Accept and hold the connection without answering
            let held = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(held);
        });

        let kind = ProbeKind::Http {
            path: "/".to_string(),
        };
        let started = std::time::Instant::now();
        let result = probe(addr, &kind, Duration::from_millis(150)).await;
        assert!(matches!(result, Err(ProbeError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
