//! Exit codes for the pw-agent CLI.
//!
//! Exit code ranges:
//! - 0-1: Operational outcomes
//! - 10-19: User/environment errors (recoverable by user action)
//! - 20-29: Internal errors

use crate::supervisor::AgentError;

/// Exit codes for pw-agent operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    // ========================================================================
    // Operational Outcomes (0-1)
    // ========================================================================
    /// Success: the agent ran and stopped cleanly
    Clean = 0,

    /// The agent stopped but some telemetry was dropped or failed to write
    Degraded = 1,

    // ========================================================================
    // User / Environment Errors (10-19)
    // ========================================================================
    /// Invalid arguments
    ArgsError = 10,

    /// Configuration missing or invalid
    ConfigError = 11,

    /// Process probing unavailable on this host
    CapabilityError = 12,

    /// Agent failed to start after every restart attempt
    RestartsExhausted = 13,

    // ========================================================================
    // Internal Errors (20-29)
    // ========================================================================
    /// Internal error (bug - please report)
    InternalError = 20,

    /// I/O error
    IoError = 21,
}

impl ExitCode {
    /// Convert to i32 for process exit.
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn is_success(self) -> bool {
        matches!(self, ExitCode::Clean)
    }

    /// Codes 10-19, resolvable by the operator.
    pub fn is_user_error(self) -> bool {
        (10..20).contains(&(self as i32))
    }

    pub fn is_error(self) -> bool {
        (self as i32) >= 10
    }

    /// Get the error code name as a string constant (for JSON output).
    pub fn code_name(&self) -> &'static str {
        match self {
            ExitCode::Clean => "OK_CLEAN",
            ExitCode::Degraded => "OK_DEGRADED",
            ExitCode::ArgsError => "ERR_ARGS",
            ExitCode::ConfigError => "ERR_CONFIG",
            ExitCode::CapabilityError => "ERR_CAPABILITY",
            ExitCode::RestartsExhausted => "ERR_RESTARTS",
            ExitCode::InternalError => "ERR_INTERNAL",
            ExitCode::IoError => "ERR_IO",
        }
    }
}

impl From<&AgentError> for ExitCode {
    fn from(err: &AgentError) -> Self {
        match err {
            AgentError::Config(_) => ExitCode::ConfigError,
            AgentError::Probe(_) => ExitCode::CapabilityError,
            AgentError::Telemetry(_) => ExitCode::IoError,
            AgentError::RestartsExhausted { .. } => ExitCode::RestartsExhausted,
            AgentError::Spawn { .. } | AgentError::AlreadyRunning => ExitCode::InternalError,
        }
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.code_name(), self.as_i32())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges() {
        assert!(ExitCode::Clean.is_success());
        assert!(!ExitCode::Degraded.is_error());
        assert!(ExitCode::ConfigError.is_user_error());
        assert!(ExitCode::IoError.is_error());
        assert!(!ExitCode::IoError.is_user_error());
        assert_eq!(i32::from(ExitCode::RestartsExhausted), 13);
        assert_eq!(ExitCode::ArgsError.to_string(), "ERR_ARGS (10)");
    }

    #[test]
    fn agent_errors_map_to_codes() {
        let config = AgentError::Config(pw_common::Error::Config("bad".into()));
        assert_eq!(ExitCode::from(&config), ExitCode::ConfigError);
        let exhausted = AgentError::RestartsExhausted {
            attempts: 3,
            last: Box::new(AgentError::AlreadyRunning),
        };
        assert_eq!(ExitCode::from(&exhausted), ExitCode::RestartsExhausted);
    }
}
