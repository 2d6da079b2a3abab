//! Linux `/proc` backend.
//!
//! # Files Parsed
//! - `/proc/[pid]/stat` - state, CPU ticks, threads, start time, exit code
//! - `/proc/[pid]/statm` - memory pages
//! - `/proc/[pid]/cmdline` - argv[0] for name matching
//! - `/proc/[pid]/fd/` - open descriptor count
//! - `/proc/stat` - boot time
//! - `/proc/meminfo` - total memory
//!
//! The `*_content` parsers are pure and used directly by tests and fuzzing.

use std::fs;
use std::path::Path;

/// Fields of `/proc/[pid]/stat` used by the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatFields {
    pub comm: String,
    pub state: char,
    pub utime: u64,
    pub stime: u64,
    pub num_threads: u32,
    /// Clock ticks after boot.
    pub starttime: u64,
    /// Raw wait status (Linux 3.5+), only meaningful for zombies.
    pub exit_code: Option<i32>,
}

impl StatFields {
    pub fn is_zombie(&self) -> bool {
        matches!(self.state, 'Z' | 'X' | 'x')
    }
}

/// Memory usage from `/proc/[pid]/statm`, in pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatmPages {
    pub size: u64,
    pub resident: u64,
}

/// Parse stat content.
///
/// Format: pid (comm) state ppid pgrp session tty_nr tpgid flags
///         minflt cminflt majflt cmajflt utime stime cutime cstime
///         priority nice num_threads itrealvalue starttime ...
///         ... exit_code (field 52)
pub fn parse_stat_content(content: &str) -> Option<StatFields> {
    let comm_start = content.find('(')?;
    // comm may itself contain ')' or spaces
    let comm_end = content.rfind(')')?;
    if comm_end < comm_start {
        return None;
    }
    let comm = content[comm_start + 1..comm_end].to_string();
    let after_comm = content.get(comm_end + 2..)?;

    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    if fields.len() < 20 {
        return None;
    }

    // Field indices (0-indexed after comm):
    // 0: state, 11: utime, 12: stime, 17: num_threads, 19: starttime, 49: exit_code
    Some(StatFields {
        comm,
        state: fields[0].chars().next()?,
        utime: fields[11].parse().ok()?,
        stime: fields[12].parse().ok()?,
        num_threads: fields[17].parse().ok()?,
        starttime: fields[19].parse().ok()?,
        exit_code: fields.get(49).and_then(|f| f.parse().ok()),
    })
}

/// Parse statm content: "size resident shared text lib data dt".
pub fn parse_statm_content(content: &str) -> Option<StatmPages> {
    let mut parts = content.split_whitespace();
    Some(StatmPages {
        size: parts.next()?.parse().ok()?,
        resident: parts.next()?.parse().ok()?,
    })
}

/// Boot time (seconds since the epoch) from `/proc/stat`.
pub fn parse_btime_content(content: &str) -> Option<i64> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("btime"))
        .and_then(|rest| rest.trim().parse().ok())
}

/// `MemTotal` from `/proc/meminfo`, in bytes.
pub fn parse_meminfo_total_content(content: &str) -> Option<u64> {
    let line = content.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}

/// Base name of argv[0] from NUL-separated cmdline content.
pub fn parse_cmdline_argv0(content: &[u8]) -> Option<String> {
    let argv0 = content.split(|b| *b == 0).next()?;
    if argv0.is_empty() {
        return None;
    }
    let argv0 = String::from_utf8_lossy(argv0);
    let base = argv0.rsplit(['/', '\\']).next()?.trim();
    (!base.is_empty()).then(|| base.to_string())
}

/// Decode a raw wait status into a termination.
pub fn decode_wait_status(status: i32) -> super::Termination {
    let signal = status & 0x7f;
    if signal == 0 {
        super::Termination::ExitCode(i64::from((status >> 8) & 0xff))
    } else {
        super::Termination::Signal(signal)
    }
}

/// Parse /proc/[pid]/stat.
pub fn parse_stat(pid: u32) -> Option<StatFields> {
    let content = fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    parse_stat_content(&content)
}

/// Parse /proc/[pid]/statm.
pub fn parse_statm(pid: u32) -> Option<StatmPages> {
    let content = fs::read_to_string(format!("/proc/{}/statm", pid)).ok()?;
    parse_statm_content(&content)
}

/// Count entries in /proc/[pid]/fd; None when unreadable.
pub fn count_fds(dir: &Path) -> Option<u32> {
    let entries = fs::read_dir(dir).ok()?;
    Some(entries.filter(|e| e.is_ok()).count() as u32)
}

/// Get system clock ticks per second.
#[cfg(unix)]
pub fn clk_tck() -> u64 {
    static CLK_TCK: std::sync::OnceLock<u64> = std::sync::OnceLock::new();
    *CLK_TCK.get_or_init(|| {
        let tck = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        if tck > 0 {
            tck as u64
        } else {
            100
        }
    })
}

#[cfg(not(unix))]
pub fn clk_tck() -> u64 {
    100
}

/// Memory page size in bytes.
#[cfg(unix)]
pub fn page_size() -> u64 {
    static PAGE: std::sync::OnceLock<u64> = std::sync::OnceLock::new();
    *PAGE.get_or_init(|| {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as u64
        } else {
            4096
        }
    })
}

#[cfg(not(unix))]
pub fn page_size() -> u64 {
    4096
}

#[cfg(target_os = "linux")]
pub use linux::ProcfsSource;

#[cfg(target_os = "linux")]
mod linux {
    use std::fs;
    use std::os::unix::fs::MetadataExt;
    use std::path::PathBuf;

    use chrono::{DateTime, TimeZone, Utc};
    use tracing::trace;

    use super::*;
    use crate::collect::{
        name_matches, Liveness, ProbeError, ProcessEntry, ProcessIdentity, ProcessSample,
        ProcessSource, Termination,
    };

    /// Reads process state from a procfs mount.
    #[derive(Debug, Clone)]
    pub struct ProcfsSource {
        root: PathBuf,
        boot_time: i64,
        euid: u32,
    }

    impl ProcfsSource {
        pub fn new() -> Result<Self, ProbeError> {
            Self::with_root("/proc")
        }

        /// Use an alternative procfs root (tests).
        pub fn with_root(root: impl Into<PathBuf>) -> Result<Self, ProbeError> {
            let root = root.into();
            let stat = fs::read_to_string(root.join("stat"))?;
            let boot_time = parse_btime_content(&stat).ok_or(ProbeError::Parse {
                pid: 0,
                what: "btime",
            })?;
            let euid = unsafe { libc::geteuid() };
            Ok(ProcfsSource {
                root,
                boot_time,
                euid,
            })
        }

        #[cfg(test)]
        pub(crate) fn with_euid(mut self, euid: u32) -> Self {
            self.euid = euid;
            self
        }

        fn pid_dir(&self, pid: u32) -> PathBuf {
            self.root.join(pid.to_string())
        }

        fn read_stat(&self, pid: u32) -> Option<StatFields> {
            let content = fs::read_to_string(self.pid_dir(pid).join("stat")).ok()?;
            parse_stat_content(&content)
        }

        /// The kernel reports a zombie's wait status only to callers with
        /// ptrace read access (same uid or root); everyone else reads 0.
        fn exit_status_readable(&self, pid: u32) -> bool {
            self.euid == 0
                || fs::metadata(self.pid_dir(pid))
                    .map(|m| m.uid() == self.euid)
                    .unwrap_or(false)
        }

        fn start_time(&self, starttime: u64) -> DateTime<Utc> {
            let secs = self.boot_time as f64 + starttime as f64 / clk_tck() as f64;
            let millis = (secs * 1000.0).round() as i64;
            Utc.timestamp_millis_opt(millis).single().unwrap_or_else(Utc::now)
        }

        /// Names a process may be matched under: comm, argv[0], exe.
        fn candidate_names(&self, pid: u32, comm: &str) -> Vec<String> {
            let mut names = vec![comm.to_string()];
            let dir = self.pid_dir(pid);
            if let Some(argv0) = fs::read(dir.join("cmdline"))
                .ok()
                .and_then(|c| parse_cmdline_argv0(&c))
            {
                names.push(argv0);
            }
            if let Some(exe) = fs::read_link(dir.join("exe"))
                .ok()
                .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            {
                names.push(exe);
            }
            names
        }
    }

    impl ProcessSource for ProcfsSource {
        fn find_by_name(&self, name: &str) -> Result<Option<ProcessEntry>, ProbeError> {
            let mut best: Option<ProcessEntry> = None;
            for entry in fs::read_dir(&self.root)? {
                let Ok(entry) = entry else { continue };
                let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok())
                else {
                    continue;
                };
                let Some(stat) = self.read_stat(pid) else {
                    continue;
                };
                if stat.is_zombie() {
                    continue;
                }
                let matched = self
                    .candidate_names(pid, &stat.comm)
                    .into_iter()
                    .find(|candidate| name_matches(candidate, name));
                let Some(matched) = matched else { continue };

                let candidate = ProcessEntry {
                    identity: ProcessIdentity {
                        pid,
                        start_token: stat.starttime,
                    },
                    name: matched,
                    start_time: self.start_time(stat.starttime),
                };
                trace!(pid, name = %candidate.name, "name match");
                let older = best
                    .as_ref()
                    .map_or(true, |b| candidate.identity.start_token < b.identity.start_token);
                if older {
                    best = Some(candidate);
                }
            }
            Ok(best)
        }

        fn identify(&self, pid: u32) -> Result<ProcessEntry, ProbeError> {
            let stat = self
                .read_stat(pid)
                .filter(|s| !s.is_zombie())
                .ok_or(ProbeError::NotFound { pid })?;
            Ok(ProcessEntry {
                identity: ProcessIdentity {
                    pid,
                    start_token: stat.starttime,
                },
                start_time: self.start_time(stat.starttime),
                name: stat.comm,
            })
        }

        fn liveness(&self, identity: &ProcessIdentity) -> Liveness {
            match self.read_stat(identity.pid) {
                None => Liveness::Exited(Termination::Unknown),
                Some(stat) if stat.starttime != identity.start_token => {
                    Liveness::Exited(Termination::Unknown)
                }
                Some(stat) if stat.is_zombie() => {
                    let termination = match stat.exit_code {
                        Some(status) if self.exit_status_readable(identity.pid) => {
                            decode_wait_status(status)
                        }
                        Some(_) => {
                            trace!(pid = identity.pid, "exit status not readable for this uid");
                            Termination::Unknown
                        }
                        None => Termination::Unknown,
                    };
                    Liveness::Exited(termination)
                }
                Some(_) => Liveness::Running,
            }
        }

        fn sample(&self, identity: &ProcessIdentity) -> Result<ProcessSample, ProbeError> {
            let pid = identity.pid;
            let dir = self.pid_dir(pid);
            let stat = self
                .read_stat(pid)
                .filter(|s| s.starttime == identity.start_token && !s.is_zombie())
                .ok_or(ProbeError::NotFound { pid })?;
            let statm = fs::read_to_string(dir.join("statm"))
                .ok()
                .and_then(|c| parse_statm_content(&c))
                .ok_or(ProbeError::Parse { pid, what: "statm" })?;

            Ok(ProcessSample {
                cpu_seconds: (stat.utime + stat.stime) as f64 / clk_tck() as f64,
                rss_bytes: statm.resident * page_size(),
                vms_bytes: statm.size * page_size(),
                thread_count: stat.num_threads,
                handle_count: count_fds(&dir.join("fd")),
            })
        }

        fn total_memory_bytes(&self) -> Option<u64> {
            let content = fs::read_to_string(self.root.join("meminfo")).ok()?;
            parse_meminfo_total_content(&content)
        }
    }
}
