//! Error types for procwatch configuration.
//!
//! Runtime components (writer, rotator, sweeper, probes, supervisor) carry
//! their own error enums; this one covers loading and validating the agent
//! configuration, which every crate shares.

use thiserror::Error;

/// Result type alias for configuration operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Configuration error.
#[derive(Error, Debug)]
pub enum Error {
    /// The file could not be read or parsed.
    #[error("configuration error: {0}")]
    Config(String),

    /// A field parsed but holds an unusable value.
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl Error {
    /// Dotted path of the offending field, when known.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            Error::Config(_) => None,
            Error::InvalidValue { field, .. } => Some(field),
        }
    }

    /// Returns a human-readable remediation hint.
    pub fn remediation(&self) -> &'static str {
        match self {
            Error::Config(_) => {
                "Check the file named by --config or PROCWATCH_CONFIG; run 'pw-agent config' to see resolved values"
            }
            Error::InvalidValue { field, .. } if *field == "monitor.process_name" => {
                "Set monitor.process_name in the config file or pass --process"
            }
            Error::InvalidValue { .. } => "Fix the named field; intervals and sizes must be positive",
        }
    }
}
