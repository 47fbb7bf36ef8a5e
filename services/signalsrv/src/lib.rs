//! Traffic-signal arbitration service
//!
//! Hosts the arbitration core: loads topology and rules, runs one worker
//! per intersection and stops cleanly on Ctrl+C / SIGTERM.

pub mod config;
pub mod service;

pub use config::Config;
pub use service::{build_arbiter, run};
