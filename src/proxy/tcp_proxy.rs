//! TCP proxy implementation.
//!
//! Provides bidirectional data transfer between a client and the node it
//! was admitted to.

use crate::backend::{BackendError, ConnectionGuard, Direction};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

/// Result of a proxy operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyResult {
    /// Bytes sent from client to backend.
    pub bytes_to_backend: u64,
    /// Bytes sent from backend to client.
    pub bytes_to_client: u64,
}

/// TCP proxy error.
#[derive(Debug, thiserror::Error)]
pub enum TcpProxyError {
    #[error("failed to connect to backend {0}: {1}")]
    BackendConnectError(SocketAddr, io::Error),

    #[error("connection timeout to backend {0}")]
    BackendTimeout(SocketAddr),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("proxy error: {0}")]
    ProxyError(#[from] io::Error),
}

/// Connect to a backend node with timeout.
#[instrument(skip_all, fields(backend = %addr))]
pub async fn connect_to_backend(
    addr: SocketAddr,
    connect_timeout: Duration,
) -> Result<TcpStream, TcpProxyError> {
    match timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            debug!("connected to backend");
            if let Err(e) = stream.set_nodelay(true) {
                warn!(error = %e, "failed to set TCP_NODELAY on backend connection");
            }
            Ok(stream)
        }
        Ok(Err(e)) => Err(TcpProxyError::BackendConnectError(addr, e)),
        Err(_) => Err(TcpProxyError::BackendTimeout(addr)),
    }
}

/// Proxy data bidirectionally between two streams.
///
/// Copies in both directions at once until both sides have closed. A
/// direction that fails counts as zero bytes.
pub async fn proxy_bidirectional<C, B>(client: C, backend: B) -> ProxyResult
where
    C: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut backend_read, mut backend_write) = tokio::io::split(backend);

    let client_to_backend = async {
        let copied = tokio::io::copy(&mut client_read, &mut backend_write).await;
        // Pass the half-close on so the backend sees EOF
        let _ = tokio::io::AsyncWriteExt::shutdown(&mut backend_write).await;
        copied
    };
    let backend_to_client = async {
        let copied = tokio::io::copy(&mut backend_read, &mut client_write).await;
        let _ = tokio::io::AsyncWriteExt::shutdown(&mut client_write).await;
        copied
    };

    let (c2b_result, b2c_result) = tokio::join!(client_to_backend, backend_to_client);

    ProxyResult {
        bytes_to_backend: c2b_result.unwrap_or(0),
        bytes_to_client: b2c_result.unwrap_or(0),
    }
}

/// Run one proxied session to the node held by `guard`.
///
/// Connects, copies both ways, and adds the byte counts to the node.
#[instrument(skip_all, fields(backend = %guard.node().address()))]
pub async fn handle_tcp_proxy(
    client_stream: TcpStream,
    guard: &ConnectionGuard,
    connect_timeout: Duration,
) -> Result<ProxyResult, TcpProxyError> {
    let node = guard.node();
    let backend_stream = connect_to_backend(node.address(), connect_timeout).await?;

    let result = proxy_bidirectional(client_stream, backend_stream).await;
    node.record_bytes(Direction::Sent, result.bytes_to_backend);
    node.record_bytes(Direction::Received, result.bytes_to_client);

    debug!(
        bytes_to_backend = result.bytes_to_backend,
        bytes_to_client = result.bytes_to_client,
        "proxy completed"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Node;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_to_backend_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let result = connect_to_backend(addr, Duration::from_secs(5)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_connect_to_backend_refused() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let result = connect_to_backend(addr, Duration::from_secs(5)).await;
        match result.unwrap_err() {
            TcpProxyError::BackendConnectError(_, _) => {}
            e => panic!("expected connect error, got: {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_proxy_session_counts_bytes() {
        // Echo backend
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = backend.accept().await.unwrap();
            let mut buf = vec![0u8; 64];
            let n = stream.read(&mut buf).await.unwrap();
            stream.write_all(&buf[..n]).await.unwrap();
            stream.write_all(b"!").await.unwrap();
        });

        // Frontend side: one accepted client connection
        let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let front_addr = front.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(front_addr).await.unwrap();
            stream.write_all(b"hello").await.unwrap();
            let mut reply = Vec::new();
            stream.read_to_end(&mut reply).await.unwrap();
            reply
        });
        let (accepted, _) = front.accept().await.unwrap();

        let node = Arc::new(Node::new(backend_addr, 1, 1).unwrap());
        let guard = node.try_acquire().unwrap();
        let result = handle_tcp_proxy(accepted, &guard, Duration::from_secs(2))
            .await
            .unwrap();
        drop(guard);

        assert_eq!(client.await.unwrap(), b"hello!");
        assert_eq!(result.bytes_to_backend, 5);
        assert_eq!(result.bytes_to_client, 6);
        assert_eq!(node.bytes_sent(), 5);
        assert_eq!(node.bytes_received(), 6);
        assert_eq!(node.active_connections(), 0);
    }
}
