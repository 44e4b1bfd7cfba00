//! Session persistence: remembering which node served a request identity.
//!
//! Persistence sits in front of the selection algorithm. A cluster asks it
//! first and only falls through to the algorithm on a miss. Mappings store
//! node addresses, never node handles, so a mapping to a node that has
//! since been removed resolves to nothing in the cluster.

use crate::backend::cache::TtlCache;
use crate::backend::request::RequestIdentity;
use crate::config::{PersistenceConfig, PersistenceMode};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Maps request identities to previously chosen nodes.
pub trait SessionPersistence: Send + Sync {
    /// The node address bound to this request's identity, if any.
    fn resolve(&self, request: &RequestIdentity) -> Option<SocketAddr>;

    /// Remember `node` for this request's identity.
    fn bind(&self, request: &RequestIdentity, node: SocketAddr);

    /// Drop every mapping that points at `node`.
    fn forget(&self, _node: SocketAddr) {}

    /// Drop all mappings.
    fn clear(&self) {}

    /// Short name for logs and status output.
    fn name(&self) -> &'static str;
}

/// Never remembers anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPersistence;

impl SessionPersistence for NoPersistence {
    fn resolve(&self, _request: &RequestIdentity) -> Option<SocketAddr> {
        None
    }

    fn bind(&self, _request: &RequestIdentity, _node: SocketAddr) {}

    fn name(&self) -> &'static str {
        "none"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum SessionKey {
    Source(IpAddr),
    FourTuple(SocketAddr, Option<SocketAddr>),
    Cookie(String),
}

/// Persistence keyed by source IP, the connection four-tuple, or a cookie.
pub struct HashPersistence {
    mode: PersistenceMode,
    sessions: TtlCache<SessionKey, SocketAddr>,
}

impl HashPersistence {
    pub fn new(mode: PersistenceMode, capacity: usize, ttl: Duration) -> Self {
        Self {
            mode,
            sessions: TtlCache::new(capacity, ttl),
        }
    }

    /// Number of live mappings.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn key(&self, request: &RequestIdentity) -> Option<SessionKey> {
        match self.mode {
            PersistenceMode::None => None,
            PersistenceMode::SourceIp => Some(SessionKey::Source(request.source().ip())),
            PersistenceMode::FourTuple => Some(SessionKey::FourTuple(
                request.source(),
                request.destination(),
            )),
            PersistenceMode::Cookie => request
                .cookie()
                .map(|cookie| SessionKey::Cookie(cookie.to_string())),
        }
    }
}

impl SessionPersistence for HashPersistence {
    fn resolve(&self, request: &RequestIdentity) -> Option<SocketAddr> {
        self.key(request).and_then(|key| self.sessions.get(&key))
    }

    fn bind(&self, request: &RequestIdentity, node: SocketAddr) {
        if let Some(key) = self.key(request) {
            self.sessions.insert(key, node);
        }
    }

    fn forget(&self, node: SocketAddr) {
        self.sessions.retain_values(|bound| *bound != node);
    }

    fn clear(&self) {
        self.sessions.clear();
    }

    fn name(&self) -> &'static str {
        match self.mode {
            PersistenceMode::None => "none",
            PersistenceMode::SourceIp => "source_ip",
            PersistenceMode::FourTuple => "four_tuple",
            PersistenceMode::Cookie => "cookie",
        }
    }
}

/// Build the persistence layer described by `config`.
pub fn build(config: &PersistenceConfig) -> Box<dyn SessionPersistence> {
    match config.mode {
        PersistenceMode::None => Box::new(NoPersistence),
        mode => Box::new(HashPersistence::new(mode, config.capacity, config.ttl)),
    }
}
