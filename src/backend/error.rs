//! Error types for the backend pool.

use std::net::SocketAddr;
use thiserror::Error;

/// Errors raised by nodes, clusters and the cluster registry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// Construction-time validation failed (weight, capacity, options).
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The node is already at its connection cap.
    #[error("node {0} is at its connection limit of {1}")]
    CapacityExceeded(SocketAddr, u32),

    /// No node in the cluster is currently healthy.
    #[error("no backend available in cluster '{0}'")]
    NoBackendAvailable(String),

    /// A node with this address already belongs to the cluster.
    #[error("node {0} already exists in cluster '{1}'")]
    DuplicateNode(SocketAddr, String),

    /// No node with this address belongs to the cluster.
    #[error("node {0} not found in cluster '{1}'")]
    NodeNotFound(SocketAddr, String),

    /// A cluster with this name is already registered.
    #[error("cluster '{0}' already exists")]
    DuplicateCluster(String),

    /// No cluster with this name is registered.
    #[error("cluster '{0}' not found")]
    ClusterNotFound(String),

    /// The cluster has been closed and accepts no further work.
    #[error("cluster '{0}' is closed")]
    ClusterClosed(String),

    /// A connection was released on a node whose counter is already zero.
    #[error("connection released on node {0} with no active connections")]
    ConnectionUnderflow(SocketAddr),

    /// Health checks can only be scheduled from inside a Tokio runtime.
    #[error("no tokio runtime available to schedule health checks")]
    RuntimeUnavailable,
}

/// Result type for backend pool operations.
pub type BackendResult<T> = Result<T, BackendError>;

impl BackendError {
    /// Whether the caller can recover by retrying or choosing another node.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::CapacityExceeded(..)
                | Self::NoBackendAvailable(_)
                | Self::DuplicateNode(..)
                | Self::NodeNotFound(..)
                | Self::DuplicateCluster(_)
                | Self::ClusterNotFound(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();

        let err = BackendError::CapacityExceeded(addr, 10);
        assert_eq!(
            err.to_string(),
            "node 127.0.0.1:8080 is at its connection limit of 10"
        );

        let err = BackendError::NoBackendAvailable("web".to_string());
        assert_eq!(err.to_string(), "no backend available in cluster 'web'");
    }

    #[test]
    fn test_recoverable() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        assert!(BackendError::CapacityExceeded(addr, 1).is_recoverable());
        assert!(BackendError::NoBackendAvailable("web".into()).is_recoverable());
        assert!(!BackendError::InvalidConfiguration("weight".into()).is_recoverable());
        assert!(!BackendError::ClusterClosed("web".into()).is_recoverable());
    }
}
