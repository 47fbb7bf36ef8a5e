//! Shared service plumbing
//!
//! - `logging`: tracing subscriber bootstrap (console + optional daily file)
//! - `shutdown`: Ctrl+C / SIGTERM handling wired to a cancellation token

pub mod logging;
pub mod shutdown;

pub use logging::{init_logging, LoggingConfig};
pub use shutdown::{cancel_on_shutdown, wait_for_shutdown};
