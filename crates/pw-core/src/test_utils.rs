//! Test doubles for the process and window capabilities.
//!
//! Exported under the `test-utils` feature so integration tests can drive
//! the agent without touching real processes.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::collect::{
    name_matches, Liveness, ProbeError, ProcessEntry, ProcessIdentity, ProcessSample,
    ProcessSource, Termination,
};
use crate::hang::{WindowHandle, WindowProbe};

/// Physical memory reported by [`MockProcessSource`].
pub const MOCK_TOTAL_MEMORY: u64 = 8 * 1024 * 1024 * 1024;

#[derive(Debug, Clone)]
struct MockProcess {
    name: String,
    start_token: u64,
    start_time: DateTime<Utc>,
    exited: Option<Termination>,
    sample: ProcessSample,
}

#[derive(Debug, Default)]
struct MockState {
    processes: HashMap<u32, MockProcess>,
    next_token: u64,
    forgotten: Vec<ProcessIdentity>,
}

/// In-memory process table.
#[derive(Debug, Default)]
pub struct MockProcessSource {
    state: Mutex<MockState>,
}

impl MockProcessSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    /// Start a process; returns its identity.
    pub fn spawn(&self, pid: u32, name: &str) -> ProcessIdentity {
        self.with_state(|s| {
            s.next_token += 1;
            let token = s.next_token;
            s.processes.insert(
                pid,
                MockProcess {
                    name: name.to_string(),
                    start_token: token,
                    start_time: Utc::now(),
                    exited: None,
                    sample: ProcessSample {
                        cpu_seconds: 0.0,
                        rss_bytes: 64 * 1024 * 1024,
                        vms_bytes: 128 * 1024 * 1024,
                        thread_count: 4,
                        handle_count: Some(16),
                    },
                },
            );
            ProcessIdentity {
                pid,
                start_token: token,
            }
        })
    }

    /// Replace `pid` with a new process of the same name.
    pub fn respawn_same_pid(&self, pid: u32) -> Option<ProcessIdentity> {
        let name = self.with_state(|s| s.processes.get(&pid).map(|p| p.name.clone()))?;
        Some(self.spawn(pid, &name))
    }

    /// Mark `pid` as exited with `termination`.
    pub fn exit(&self, pid: u32, termination: Termination) {
        self.with_state(|s| {
            if let Some(p) = s.processes.get_mut(&pid) {
                p.exited = Some(termination);
            }
        });
    }

    /// Remove `pid` entirely, as if it had been reaped.
    pub fn vanish(&self, pid: u32) {
        self.with_state(|s| {
            s.processes.remove(&pid);
        });
    }

    pub fn set_sample(&self, pid: u32, sample: ProcessSample) {
        self.with_state(|s| {
            if let Some(p) = s.processes.get_mut(&pid) {
                p.sample = sample;
            }
        });
    }

    /// Add CPU time to `pid`.
    pub fn burn_cpu(&self, pid: u32, seconds: f64) {
        self.with_state(|s| {
            if let Some(p) = s.processes.get_mut(&pid) {
                p.sample.cpu_seconds += seconds;
            }
        });
    }

    /// Identities released through [`ProcessSource::forget`].
    pub fn forgotten(&self) -> Vec<ProcessIdentity> {
        self.with_state(|s| s.forgotten.clone())
    }
}

impl ProcessSource for MockProcessSource {
    fn find_by_name(&self, name: &str) -> Result<Option<ProcessEntry>, ProbeError> {
        Ok(self.with_state(|s| {
            s.processes
                .iter()
                .filter(|(_, p)| p.exited.is_none() && name_matches(&p.name, name))
                .min_by_key(|(_, p)| p.start_token)
                .map(|(&pid, p)| ProcessEntry {
                    identity: ProcessIdentity {
                        pid,
                        start_token: p.start_token,
                    },
                    name: p.name.clone(),
                    start_time: p.start_time,
                })
        }))
    }

    fn identify(&self, pid: u32) -> Result<ProcessEntry, ProbeError> {
        self.with_state(|s| match s.processes.get(&pid) {
            Some(p) if p.exited.is_none() => Ok(ProcessEntry {
                identity: ProcessIdentity {
                    pid,
                    start_token: p.start_token,
                },
                name: p.name.clone(),
                start_time: p.start_time,
            }),
            _ => Err(ProbeError::NotFound { pid }),
        })
    }

    fn liveness(&self, identity: &ProcessIdentity) -> Liveness {
        self.with_state(|s| match s.processes.get(&identity.pid) {
            Some(p) if p.start_token == identity.start_token => match p.exited {
                Some(termination) => Liveness::Exited(termination),
                None => Liveness::Running,
            },
            _ => Liveness::Exited(Termination::Unknown),
        })
    }

    fn sample(&self, identity: &ProcessIdentity) -> Result<ProcessSample, ProbeError> {
        self.with_state(|s| match s.processes.get(&identity.pid) {
            Some(p) if p.start_token == identity.start_token && p.exited.is_none() => {
                Ok(p.sample)
            }
            _ => Err(ProbeError::NotFound { pid: identity.pid }),
        })
    }

    fn total_memory_bytes(&self) -> Option<u64> {
        Some(MOCK_TOTAL_MEMORY)
    }

    fn forget(&self, identity: &ProcessIdentity) {
        self.with_state(|s| s.forgotten.push(*identity));
    }
}

#[derive(Debug, Clone)]
struct MockWindow {
    handle: WindowHandle,
    title: String,
    responsive: bool,
}

/// In-memory window table keyed by owning pid.
#[derive(Debug, Default)]
pub struct MockWindowProbe {
    windows: Mutex<HashMap<u32, Vec<MockWindow>>>,
}

impl MockWindowProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Give `pid` one responsive top-level window.
    pub fn add_window(&self, pid: u32, handle: u64, title: &str) {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        windows.entry(pid).or_default().push(MockWindow {
            handle: WindowHandle(handle),
            title: title.to_string(),
            responsive: true,
        });
    }

    pub fn set_responsive(&self, handle: u64, responsive: bool) {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        for w in windows.values_mut().flatten() {
            if w.handle == WindowHandle(handle) {
                w.responsive = responsive;
            }
        }
    }

    pub fn close_all(&self, pid: u32) {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        windows.remove(&pid);
    }

    fn find(&self, handle: WindowHandle) -> Option<MockWindow> {
        let windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        windows.values().flatten().find(|w| w.handle == handle).cloned()
    }
}

impl WindowProbe for MockWindowProbe {
    fn enumerate_top_level_windows(&self, pid: u32) -> Vec<WindowHandle> {
        let windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        windows
            .get(&pid)
            .map(|ws| ws.iter().map(|w| w.handle).collect())
            .unwrap_or_default()
    }

    fn probe_responsive(&self, window: WindowHandle, _timeout: Duration) -> bool {
        self.find(window).is_some_and(|w| w.responsive)
    }

    fn window_title(&self, window: WindowHandle) -> String {
        self.find(window).map(|w| w.title).unwrap_or_default()
    }
}
