//! Proxy data paths for TCP streams and UDP flows.

mod tcp_proxy;
mod udp;

pub use tcp_proxy::{ProxyResult, TcpProxyError, connect_to_backend, handle_tcp_proxy, proxy_bidirectional};
pub use udp::{FlowState, FlowTable, Forwarded, MAX_DATAGRAM, UdpConnection, UdpProxyError};
