//! UDP flows with asynchronous backend connect.
//!
//! A flow starts PENDING while its backend socket is being set up. Inbound
//! datagrams queue in a bounded backlog owned by the PENDING phase; once the
//! backend socket is ready the backlog is flushed in order and the flow goes
//! ACTIVE. A failed connect discards the backlog and closes the flow.

use crate::backend::{BackendError, ConnectionGuard, Direction, Node};
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex as SyncMutex;
use std::collections::VecDeque;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace};

/// Largest datagram relayed back to a client.
pub const MAX_DATAGRAM: usize = 65_535;

/// UDP proxy error.
#[derive(Debug, thiserror::Error)]
pub enum UdpProxyError {
    #[error("failed to bind backend socket: {0}")]
    Bind(#[source] io::Error),

    #[error("failed to connect to backend {0}: {1}")]
    Connect(SocketAddr, #[source] io::Error),

    #[error("connection timeout to backend {0}")]
    ConnectTimeout(SocketAddr),

    #[error("failed to send to backend: {0}")]
    Send(#[source] io::Error),

    #[error("flow is closed")]
    Closed,

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Lifecycle of a flow.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Pending = 0,
    Active = 1,
    Closed = 2,
}

impl FlowState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Pending,
            1 => Self::Active,
            _ => Self::Closed,
        }
    }
}

enum Phase {
    Pending(VecDeque<Bytes>),
    Active(Arc<UdpSocket>),
    Closed,
}

/// What happened to a datagram handed to [`UdpConnection::forward`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forwarded {
    /// Sent to the backend.
    Sent(usize),
    /// Queued until the backend socket is ready.
    Buffered,
    /// Backlog full; the datagram was discarded.
    Dropped,
}

/// One client flow bound to one node.
pub struct UdpConnection {
    client: SocketAddr,
    node: Arc<Node>,
    backlog_limit: usize,
    phase: Mutex<Phase>,
    state: AtomicU8,
    // Released on close, not on drop of the last handle
    admission: SyncMutex<Option<ConnectionGuard>>,
    relay: SyncMutex<Option<JoinHandle<()>>>,
    created: Instant,
    last_activity_ms: AtomicU64,
    bytes_to_backend: AtomicU64,
    bytes_to_client: AtomicU64,
}

impl UdpConnection {
    /// A new PENDING flow holding `admission` on its node.
    pub fn new(client: SocketAddr, admission: ConnectionGuard, backlog_limit: usize) -> Arc<Self> {
        Arc::new(Self {
            client,
            node: Arc::clone(admission.node()),
            backlog_limit: backlog_limit.max(1),
            phase: Mutex::new(Phase::Pending(VecDeque::new())),
            state: AtomicU8::new(FlowState::Pending as u8),
            admission: SyncMutex::new(Some(admission)),
            relay: SyncMutex::new(None),
            created: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            bytes_to_backend: AtomicU64::new(0),
            bytes_to_client: AtomicU64::new(0),
        })
    }

    pub fn client(&self) -> SocketAddr {
        self.client
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn state(&self) -> FlowState {
        FlowState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Datagrams waiting for the backend socket.
    pub async fn backlog_len(&self) -> usize {
        match &*self.phase.lock().await {
            Phase::Pending(backlog) => backlog.len(),
            _ => 0,
        }
    }

    /// Time since the flow last carried traffic in either direction.
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.created.elapsed().saturating_sub(last)
    }

    /// How long the flow has existed.
    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    pub fn bytes_to_backend(&self) -> u64 {
        self.bytes_to_backend.load(Ordering::Relaxed)
    }

    pub fn bytes_to_client(&self) -> u64 {
        self.bytes_to_client.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        let now = u64::try_from(self.created.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_activity_ms.store(now, Ordering::Relaxed);
    }

    fn sent(&self, bytes: usize) {
        self.bytes_to_backend
            .fetch_add(bytes as u64, Ordering::Relaxed);
        self.node.record_bytes(Direction::Sent, bytes as u64);
    }

    /// Pass a client datagram towards the backend.
    pub async fn forward(&self, datagram: Bytes) -> Result<Forwarded, UdpProxyError> {
        self.touch();
        let mut phase = self.phase.lock().await;
        match &mut *phase {
            Phase::Pending(backlog) => {
                if backlog.len() >= self.backlog_limit {
                    trace!(client = %self.client, "backlog full, dropping datagram");
                    return Ok(Forwarded::Dropped);
                }
                backlog.push_back(datagram);
                Ok(Forwarded::Buffered)
            }
            Phase::Active(socket) => {
                let n = socket.send(&datagram).await.map_err(UdpProxyError::Send)?;
                self.sent(n);
                Ok(Forwarded::Sent(n))
            }
            Phase::Closed => Err(UdpProxyError::Closed),
        }
    }

    /// Open the backend socket, flush the backlog and go ACTIVE.
    ///
    /// On failure the backlog is discarded and the flow is closed.
    pub async fn connect(&self, connect_timeout: Duration) -> Result<Arc<UdpSocket>, UdpProxyError> {
        let target = self.node.address();
        let socket = match timeout(connect_timeout, open_backend_socket(target)).await {
            Ok(Ok(socket)) => Arc::new(socket),
            Ok(Err(e)) => {
                self.close().await;
                return Err(e);
            }
            Err(_) => {
                self.close().await;
                return Err(UdpProxyError::ConnectTimeout(target));
            }
        };

        let mut phase = self.phase.lock().await;
        let backlog = match std::mem::replace(&mut *phase, Phase::Active(Arc::clone(&socket))) {
            Phase::Pending(backlog) => backlog,
            Phase::Active(_) => VecDeque::new(),
            Phase::Closed => {
                *phase = Phase::Closed;
                return Err(UdpProxyError::Closed);
            }
        };

        let queued = backlog.len();
        for datagram in backlog {
            match socket.send(&datagram).await {
                Ok(n) => self.sent(n),
                Err(e) => {
                    *phase = Phase::Closed;
                    drop(phase);
                    self.close().await;
                    return Err(UdpProxyError::Send(e));
                }
            }
        }
        self.state.store(FlowState::Active as u8, Ordering::Release);
        debug!(client = %self.client, backend = %target, flushed = queued, "flow active");
        Ok(socket)
    }

    /// Relay backend replies to the client through `frontend` until closed.
    pub fn spawn_reply_relay(self: &Arc<Self>, backend: Arc<UdpSocket>, frontend: Arc<UdpSocket>) {
        let flow = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                let n = match backend.recv(&mut buf).await {
                    Ok(n) => n,
                    Err(e) => {
                        // ICMP unreachable and friends: the backend is gone
                        debug!(client = %flow.client, error = %e, "backend receive failed");
                        flow.close().await;
                        break;
                    }
                };
                flow.touch();
                flow.bytes_to_client
                    .fetch_add(n as u64, Ordering::Relaxed);
                flow.node.record_bytes(Direction::Received, n as u64);
                if let Err(e) = frontend.send_to(&buf[..n], flow.client).await {
                    debug!(client = %flow.client, error = %e, "reply to client failed");
                }
            }
        });

        let mut relay = self.relay.lock();
        if self.state() == FlowState::Closed {
            handle.abort();
        } else if let Some(previous) = relay.replace(handle) {
            previous.abort();
        }
    }

    /// Close the flow: drop any backlog, stop the reply relay and release
    /// the node admission. Idempotent.
    pub async fn close(&self) {
        {
            let mut phase = self.phase.lock().await;
            *phase = Phase::Closed;
        }
        if self.state.swap(FlowState::Closed as u8, Ordering::AcqRel) == FlowState::Closed as u8 {
            return;
        }
        // The relay may be the caller; aborting our own task only takes
        // effect at its next await, after this returns.
        if let Some(relay) = self.relay.lock().take() {
            relay.abort();
        }
        self.admission.lock().take();
        debug!(client = %self.client, node = %self.node.address(), "flow closed");
    }
}

async fn open_backend_socket(target: SocketAddr) -> Result<UdpSocket, UdpProxyError> {
    let local = match target {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
    };
    let socket = UdpSocket::bind(local).await.map_err(UdpProxyError::Bind)?;
    socket
        .connect(target)
        .await
        .map_err(|e| UdpProxyError::Connect(target, e))?;
    Ok(socket)
}

/// Active flows keyed by client address.
#[derive(Default)]
pub struct FlowTable {
    flows: DashMap<SocketAddr, Arc<UdpConnection>>,
}

impl FlowTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, client: SocketAddr) -> Option<Arc<UdpConnection>> {
        self.flows.get(&client).map(|f| Arc::clone(f.value()))
    }

    /// Insert `flow` unless the client already has a live one; returns the
    /// flow now in the table and whether it is the one passed in.
    pub fn insert(&self, flow: Arc<UdpConnection>) -> (Arc<UdpConnection>, bool) {
        match self.flows.entry(flow.client()) {
            Entry::Occupied(mut entry) => {
                if entry.get().state() == FlowState::Closed {
                    entry.insert(Arc::clone(&flow));
                    (flow, true)
                } else {
                    (Arc::clone(entry.get()), false)
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&flow));
                (flow, true)
            }
        }
    }

    /// Remove the flow for `client` if it is still `flow`.
    pub fn remove(&self, flow: &Arc<UdpConnection>) -> bool {
        self.flows
            .remove_if(&flow.client(), |_, current| Arc::ptr_eq(current, flow))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Remove and close every flow that is CLOSED or idle for longer than
    /// `idle_timeout`. Returns the removed flows.
    pub async fn reap(&self, idle_timeout: Duration) -> Vec<Arc<UdpConnection>> {
        let candidates: Vec<SocketAddr> = self
            .flows
            .iter()
            .filter(|f| f.state() == FlowState::Closed || f.idle_for() > idle_timeout)
            .map(|f| *f.key())
            .collect();

        let mut reaped = Vec::with_capacity(candidates.len());
        for client in candidates {
            let removed = self.flows.remove_if(&client, |_, f| {
                f.state() == FlowState::Closed || f.idle_for() > idle_timeout
            });
            if let Some((_, flow)) = removed {
                flow.close().await;
                reaped.push(flow);
            }
        }
        reaped
    }

    /// Remove and close every flow.
    pub async fn close_all(&self) -> Vec<Arc<UdpConnection>> {
        let clients: Vec<SocketAddr> = self.flows.iter().map(|f| *f.key()).collect();
        let mut closed = Vec::with_capacity(clients.len());
        for client in clients {
            if let Some((_, flow)) = self.flows.remove(&client) {
                flow.close().await;
                closed.push(flow);
            }
        }
        closed
    }
}
