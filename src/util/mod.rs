//! Process-level helpers.

mod logging;
mod shutdown;

pub use logging::{env_filter, init_logging};
pub use shutdown::{ShutdownSignal, wait_for_os_signal};
