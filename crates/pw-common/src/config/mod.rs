//! Agent configuration loading and validation.
//!
//! This module provides:
//! - Typed configuration sections (`monitor`, `logging`, `event_log`)
//! - Deterministic config resolution (CLI > env > XDG > defaults)
//! - Semantic validation
//! - Config snapshots for the startup log

pub mod resolve;
pub mod snapshot;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use resolve::{ConfigPaths, ConfigResolver};
pub use snapshot::ConfigSnapshot;

/// Keywords that mark an event-log record as relevant to a JVM application.
pub const DEFAULT_JAVA_KEYWORDS: [&str; 7] = [
    "java",
    "jvm",
    "javafx",
    "OutOfMemoryError",
    "StackOverflowError",
    "NullPointerException",
    "heap space",
];

/// Complete agent configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub monitor: MonitorConfig,
    pub logging: LoggingConfig,
    pub event_log: EventLogConfig,
}

/// Target process and probe cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Executable name of the monitored process (case-insensitive).
    pub process_name: String,
    /// Directory for telemetry files. Platform data dir when unset.
    pub log_dir: Option<PathBuf>,
    pub performance_interval_seconds: u64,
    pub process_check_interval_seconds: u64,
    pub hang_check_interval_seconds: u64,
    /// Responsiveness window for a single window probe.
    pub hang_timeout_seconds: u64,
    pub hang_detection: bool,
    /// Sample the agent's own resource usage.
    pub monitor_self: bool,
    pub self_monitor_interval_seconds: u64,
    pub max_memory_mb: f64,
    pub max_cpu_percent: f64,
    /// Startup attempts before the service loop gives up.
    pub max_restarts: u32,
    pub restart_delay_seconds: u64,
    pub shutdown_timeout_seconds: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            process_name: String::new(),
            log_dir: None,
            performance_interval_seconds: 60,
            process_check_interval_seconds: 5,
            hang_check_interval_seconds: 5,
            hang_timeout_seconds: 5,
            hang_detection: true,
            monitor_self: true,
            self_monitor_interval_seconds: 300,
            max_memory_mb: 50.0,
            max_cpu_percent: 5.0,
            max_restarts: 5,
            restart_delay_seconds: 60,
            shutdown_timeout_seconds: 10,
        }
    }
}

/// Telemetry pipeline tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub max_file_size_mb: u64,
    pub retention_days: u64,
    pub batch_size: usize,
    pub flush_interval_seconds: u64,
    pub queue_capacity: usize,
    pub file_prefix: String,
    pub retention_sweep_interval_seconds: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            max_file_size_mb: 100,
            retention_days: 30,
            batch_size: 50,
            flush_interval_seconds: 5,
            queue_capacity: 10_000,
            file_prefix: "pos_monitor".to_string(),
            retention_sweep_interval_seconds: 3600,
        }
    }
}

/// Event-log tailing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventLogConfig {
    pub enabled: bool,
    /// Log files to tail.
    pub sources: Vec<PathBuf>,
    /// Severities to keep: `critical`, `error`, `warning`, `information`.
    pub levels: Vec<String>,
    pub keywords: Vec<String>,
    pub poll_interval_seconds: u64,
    /// Emit records already present when a source is first opened.
    pub read_existing: bool,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        EventLogConfig {
            enabled: false,
            sources: Vec::new(),
            levels: vec!["critical".into(), "error".into(), "warning".into()],
            keywords: DEFAULT_JAVA_KEYWORDS.iter().map(|k| k.to_string()).collect(),
            poll_interval_seconds: 30,
            read_existing: false,
        }
    }
}

/// On-disk configuration format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Toml,
}

impl ConfigFormat {
    /// Pick the format from the file extension; JSON unless `.toml`.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => ConfigFormat::Toml,
            _ => ConfigFormat::Json,
        }
    }
}

impl AgentConfig {
    /// Parse configuration text in the given format.
    pub fn parse(content: &str, format: ConfigFormat) -> Result<Self> {
        match format {
            ConfigFormat::Json => serde_json::from_str(content)
                .map_err(|e| Error::Config(format!("invalid JSON config: {}", e))),
            ConfigFormat::Toml => toml::from_str(content)
                .map_err(|e| Error::Config(format!("invalid TOML config: {}", e))),
        }
    }

    /// Validate value ranges. Does not require a target process.
    pub fn validate(&self) -> Result<()> {
        let m = &self.monitor;
        let l = &self.logging;
        let nonzero = [
            ("monitor.performance_interval_seconds", m.performance_interval_seconds),
            ("monitor.process_check_interval_seconds", m.process_check_interval_seconds),
            ("monitor.hang_check_interval_seconds", m.hang_check_interval_seconds),
            ("monitor.hang_timeout_seconds", m.hang_timeout_seconds),
            ("monitor.self_monitor_interval_seconds", m.self_monitor_interval_seconds),
            ("logging.max_file_size_mb", l.max_file_size_mb),
            ("logging.retention_days", l.retention_days),
            ("logging.flush_interval_seconds", l.flush_interval_seconds),
            ("logging.retention_sweep_interval_seconds", l.retention_sweep_interval_seconds),
            ("event_log.poll_interval_seconds", self.event_log.poll_interval_seconds),
        ];
        for (field, value) in nonzero {
            if value == 0 {
                return Err(Error::InvalidValue {
                    field,
                    reason: "must be greater than zero".into(),
                });
            }
        }
        if l.batch_size == 0 {
            return Err(Error::InvalidValue {
                field: "logging.batch_size",
                reason: "must be at least 1".into(),
            });
        }
        if l.queue_capacity == 0 {
            return Err(Error::InvalidValue {
                field: "logging.queue_capacity",
                reason: "must be at least 1".into(),
            });
        }
        if l.file_prefix.is_empty() || l.file_prefix.contains(['/', '\\']) {
            return Err(Error::InvalidValue {
                field: "logging.file_prefix",
                reason: format!("'{}' is not a valid file name prefix", l.file_prefix),
            });
        }
        if !(m.max_cpu_percent > 0.0) || !(m.max_memory_mb > 0.0) {
            return Err(Error::InvalidValue {
                field: "monitor.max_cpu_percent/max_memory_mb",
                reason: "limits must be positive".into(),
            });
        }
        for level in &self.event_log.levels {
            if !matches!(
                level.to_ascii_lowercase().as_str(),
                "critical" | "error" | "warning" | "information"
            ) {
                return Err(Error::InvalidValue {
                    field: "event_log.levels",
                    reason: format!("unknown level '{}'", level),
                });
            }
        }
        Ok(())
    }

    /// Validate for running the agent: ranges plus a target process.
    pub fn validate_for_run(&self) -> Result<()> {
        self.validate()?;
        if self.monitor.process_name.trim().is_empty() {
            return Err(Error::InvalidValue {
                field: "monitor.process_name",
                reason: "a target process name is required".into(),
            });
        }
        Ok(())
    }

    /// Effective telemetry directory.
    pub fn log_dir(&self) -> PathBuf {
        self.monitor.log_dir.clone().unwrap_or_else(default_log_dir)
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        self.logging.max_file_size_mb.saturating_mul(1024 * 1024)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.logging.flush_interval_seconds)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.logging.retention_days.saturating_mul(86_400))
    }

    pub fn retention_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.logging.retention_sweep_interval_seconds)
    }

    pub fn performance_interval(&self) -> Duration {
        Duration::from_secs(self.monitor.performance_interval_seconds)
    }

    pub fn process_check_interval(&self) -> Duration {
        Duration::from_secs(self.monitor.process_check_interval_seconds)
    }

    pub fn hang_check_interval(&self) -> Duration {
        Duration::from_secs(self.monitor.hang_check_interval_seconds)
    }

    pub fn hang_timeout(&self) -> Duration {
        Duration::from_secs(self.monitor.hang_timeout_seconds)
    }

    pub fn self_monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor.self_monitor_interval_seconds)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.monitor.restart_delay_seconds)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.monitor.shutdown_timeout_seconds)
    }

    pub fn event_poll_interval(&self) -> Duration {
        Duration::from_secs(self.event_log.poll_interval_seconds)
    }
}

/// Platform data directory for telemetry (`~/.local/share/procwatch/logs`).
pub fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("procwatch").join("logs"))
        .unwrap_or_else(|| PathBuf::from("logs"))
}

/// How a config file was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigResolution {
    /// From explicit CLI flag
    CliFlag,
    /// From environment variable
    EnvVar,
    /// From XDG config directory
    XdgConfig,
    /// Using built-in defaults
    Default,
}

impl std::fmt::Display for ConfigResolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigResolution::CliFlag => write!(f, "cli"),
            ConfigResolution::EnvVar => write!(f, "env"),
            ConfigResolution::XdgConfig => write!(f, "xdg"),
            ConfigResolution::Default => write!(f, "default"),
        }
    }
}
