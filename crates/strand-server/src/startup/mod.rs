//! Application startup utilities module.
//!
//! Logging, shutdown handling and the assembly of a replication node.

mod logging;
mod node;
mod shutdown;

pub use logging::{LogRotation, LoggingConfig, LoggingGuard, init_logging};
pub use node::{RunningNode, bootstrap, run};
pub use shutdown::{ShutdownSignal, listen_for_os_signals, run_with_shutdown, with_deadline};
