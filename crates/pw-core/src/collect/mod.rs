//! Process observation backends.
//!
//! The watcher only talks to a [`ProcessSource`]. Linux reads `/proc`
//! ([`procfs`]); Windows uses the Win32 process APIs. Tests substitute an
//! in-memory source.

pub mod procfs;
#[cfg(windows)]
pub mod windows;

use std::io;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from process probes.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("process {pid} not found")]
    NotFound { pid: u32 },

    #[error("access denied to process {pid}")]
    AccessDenied { pid: u32 },

    #[error("failed to parse {what} for process {pid}")]
    Parse { pid: u32, what: &'static str },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("unsupported platform: {0}")]
    Unsupported(String),
}

/// Process identity that survives PID reuse.
///
/// `start_token` is an OS start marker (clock ticks since boot on Linux,
/// creation FILETIME on Windows).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessIdentity {
    pub pid: u32,
    pub start_token: u64,
}

/// A process found by name.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessEntry {
    pub identity: ProcessIdentity,
    pub name: String,
    pub start_time: DateTime<Utc>,
}

/// Cumulative counters and gauges read from one probe.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ProcessSample {
    /// User plus system CPU time since process start.
    pub cpu_seconds: f64,
    pub rss_bytes: u64,
    pub vms_bytes: u64,
    pub thread_count: u32,
    /// Open handles (Windows) or file descriptors (Linux), when readable.
    pub handle_count: Option<u32>,
}

/// How a process ended, as far as the OS will say.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum Termination {
    /// Exit code. Windows codes are sign-extended from the 32-bit DWORD.
    ExitCode(i64),
    /// Killed by a signal (Unix).
    Signal(i32),
    /// The process was reaped before its status could be read.
    Unknown,
}

/// Result of a liveness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Running,
    Exited(Termination),
}

/// Capability to discover and observe processes.
pub trait ProcessSource: Send + Sync {
    /// Find the oldest process whose name matches `name`.
    fn find_by_name(&self, name: &str) -> Result<Option<ProcessEntry>, ProbeError>;

    /// Look up a live process by pid.
    fn identify(&self, pid: u32) -> Result<ProcessEntry, ProbeError>;

    /// Check whether the identified process is still the one running.
    ///
    /// A recycled PID counts as exited with an unknown status.
    fn liveness(&self, identity: &ProcessIdentity) -> Liveness;

    /// Read cumulative CPU time and current memory and thread counters.
    fn sample(&self, identity: &ProcessIdentity) -> Result<ProcessSample, ProbeError>;

    /// Physical memory size, used for `memory_percent`.
    fn total_memory_bytes(&self) -> Option<u64>;

    /// Release any per-process resources held for `identity`.
    fn forget(&self, _identity: &ProcessIdentity) {}
}

/// The backend for the current platform.
pub fn native_source() -> Result<Arc<dyn ProcessSource>, ProbeError> {
    #[cfg(target_os = "linux")]
    {
        Ok(Arc::new(procfs::ProcfsSource::new()?))
    }
    #[cfg(windows)]
    {
        Ok(Arc::new(windows::Win32Source::new()))
    }
    #[cfg(not(any(target_os = "linux", windows)))]
    {
        Err(ProbeError::Unsupported(std::env::consts::OS.to_string()))
    }
}

/// Case-insensitive name match. A trailing `.exe` on either side is
/// ignored, so `YourPOSApp.exe` also matches a Linux `yourposapp`.
pub fn name_matches(candidate: &str, target: &str) -> bool {
    fn base(s: &str) -> &str {
        let s = s.trim();
        match s.len().checked_sub(4) {
            Some(cut) if s.is_char_boundary(cut) && s[cut..].eq_ignore_ascii_case(".exe") => {
                &s[..cut]
            }
            _ => s,
        }
    }
    let (c, t) = (base(candidate), base(target));
    !t.is_empty() && c.eq_ignore_ascii_case(t)
}
