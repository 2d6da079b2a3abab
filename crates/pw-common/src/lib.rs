//! procwatch common types and errors.
//!
//! This crate provides foundational types shared by the telemetry pipeline
//! and the monitoring agent:
//! - The event model every producer emits
//! - Agent configuration loading and validation
//! - Common error types
//! - Output format specifications
//! - The cooperative shutdown signal

pub mod config;
pub mod error;
pub mod event;
pub mod output;
pub mod shutdown;

pub use config::{AgentConfig, ConfigPaths, ConfigResolver, ConfigSnapshot};
pub use error::{Error, Result};
pub use event::{Event, EventType, Payload};
pub use output::OutputFormat;
pub use shutdown::{join_timeout, Shutdown};
