//! procwatch agent library.
//!
//! This library provides the monitoring side of procwatch:
//! - Process discovery, liveness and resource sampling
//! - Exit-status classification for crash reporting
//! - UI hang detection
//! - Application log tailing
//! - The agent supervisor that wires these to the telemetry pipeline
//!
//! The binary entry point is in `main.rs`.

pub mod collect;
pub mod crash;
pub mod eventlog;
pub mod exit_codes;
pub mod hang;
pub mod logging;
pub mod selfmon;
pub mod supervisor;
pub mod tasks;
pub mod watch;

// Re-export test doubles for integration tests
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use supervisor::{Agent, AgentError, AgentStatus};
