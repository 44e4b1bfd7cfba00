//! Health checking for backend nodes.

mod checker;
mod manager;
mod state;

pub use checker::{ProbeError, probe};
pub use manager::{HealthCheckManager, HealthEvent};
pub use state::{HealthTracker, Transition};
