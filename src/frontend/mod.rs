//! Frontend listeners.
//!
//! Thin TCP and UDP drivers that feed client traffic through a cluster.

mod datagram;
mod listener;

pub use datagram::DatagramFrontend;
pub use listener::FrontendListener;
