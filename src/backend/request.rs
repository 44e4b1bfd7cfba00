//! Request identity passed from the front-ends to the selection path.

use std::net::SocketAddr;

/// The information selection needs about one inbound unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestIdentity {
    source: SocketAddr,
    destination: Option<SocketAddr>,
    cookie: Option<String>,
}

impl RequestIdentity {
    /// Identity for a request arriving from `source`.
    pub fn new(source: SocketAddr) -> Self {
        Self {
            source,
            destination: None,
            cookie: None,
        }
    }

    /// Attach the local address the request arrived on.
    pub fn with_destination(mut self, destination: SocketAddr) -> Self {
        self.destination = Some(destination);
        self
    }

    /// Attach an L7 session cookie.
    pub fn with_cookie(mut self, cookie: impl Into<String>) -> Self {
        self.cookie = Some(cookie.into());
        self
    }

    pub fn source(&self) -> SocketAddr {
        self.source
    }

    pub fn destination(&self) -> Option<SocketAddr> {
        self.destination
    }

    pub fn cookie(&self) -> Option<&str> {
        self.cookie.as_deref()
    }
}

impl From<SocketAddr> for RequestIdentity {
    fn from(source: SocketAddr) -> Self {
        Self::new(source)
    }
}
