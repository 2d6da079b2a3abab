//! Structured diagnostics for the agent.
//!
//! Provides dual-mode logging:
//! - Human-readable console output for interactive use
//! - Machine-parseable JSON lines for service deployments
//!
//! Diagnostics go to stderr (or `--log-file`); stdout is reserved for
//! command output. Each long-running component receives its own
//! [`tracing::Span`] at construction and logs inside it, so every line
//! carries the component name and the agent's run id.

pub mod config;

pub use config::{LogConfig, LogFormat, LogLevel};

use std::fs::{self, OpenOptions};
use std::io::{self, IsTerminal};
use std::sync::Mutex;

use tracing::Span;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the logging subsystem.
///
/// Must be called once at startup before any logging occurs. Fails if the
/// log file cannot be opened or a subscriber is already installed.
pub fn init_logging(config: &LogConfig) -> io::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.directives()));

    let (writer, ansi) = match &config.file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            (BoxMakeWriter::new(Mutex::new(file)), false)
        }
        None => (BoxMakeWriter::new(io::stderr), io::stderr().is_terminal()),
    };

    let registry = tracing_subscriber::registry().with(filter);
    let result = match config.format {
        LogFormat::Human => {
            let layer = fmt::layer()
                .with_writer(writer)
                .with_target(false)
                .with_thread_names(true)
                .with_ansi(ansi);
            if config.timestamps {
                registry.with(layer).try_init()
            } else {
                registry.with(layer.without_time()).try_init()
            }
        }
        LogFormat::Jsonl => registry
            .with(
                fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_current_span(true)
                    .with_span_list(false),
            )
            .try_init(),
    };
    result.map_err(|e| io::Error::new(io::ErrorKind::AlreadyExists, e.to_string()))
}

/// Generate a unique run ID for this agent instance.
pub fn generate_run_id() -> String {
    let uuid = uuid::Uuid::new_v4();
    // Shorten to first 12 hex chars for readability
    format!("run-{}", &uuid.simple().to_string()[..12])
}

/// Span handed to a component at construction.
pub fn component_span(component: &'static str, run_id: &str) -> Span {
    tracing::info_span!("component", component, run_id = %run_id)
}
