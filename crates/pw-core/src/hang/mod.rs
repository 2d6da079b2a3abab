//! UI hang detection.
//!
//! Every check enumerates the target's visible top-level windows and sends
//! each one a bounded round-trip probe. The process counts as hung when any
//! window fails the probe. Per pid, a small state machine turns probe
//! results into events:
//!
//! | prior      | probe      | new        | event           |
//! |------------|------------|------------|-----------------|
//! | responsive | hung       | hanging    | `hang`          |
//! | hanging    | hung       | hanging    | `hang_update`   |
//! | hanging    | responsive | responsive | `hang_recovery` |
//! | responsive | responsive | responsive | none            |
//!
//! A process without windows (a console app, or one still starting up)
//! has its record cleared and produces nothing.

#[cfg(windows)]
pub mod windows;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use pw_common::{Event, EventType, Shutdown};
use pw_telemetry::EventSender;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn, Span};

use crate::tasks::run_periodic;
use crate::watch::{ProcessWatcher, TargetProcess};

/// Opaque top-level window handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WindowHandle(pub u64);

/// Capability to inspect another process's windows.
pub trait WindowProbe: Send + Sync {
    /// Visible, parentless windows owned by `pid`.
    fn enumerate_top_level_windows(&self, pid: u32) -> Vec<WindowHandle>;

    /// Whether `window` answers a no-op message within `timeout`.
    fn probe_responsive(&self, window: WindowHandle, timeout: Duration) -> bool;

    fn window_title(&self, window: WindowHandle) -> String;
}

/// The window probe for this platform, if it has one.
pub fn native_probe() -> Option<Arc<dyn WindowProbe>> {
    #[cfg(windows)]
    {
        Some(Arc::new(windows::Win32WindowProbe::new()))
    }
    #[cfg(not(windows))]
    {
        None
    }
}

/// Per-pid hang state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HangRecord {
    Responsive,
    Hanging {
        since: DateTime<Utc>,
        /// Last reported duration; reported durations never decrease.
        reported_secs: f64,
    },
}

/// A window that failed the responsiveness probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HungWindow {
    pub handle: WindowHandle,
    pub title: String,
}

/// Seconds between `since` and `now`, at 0.1 s resolution.
fn duration_tenths(since: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let millis = (now - since).num_milliseconds().max(0);
    (millis as f64 / 100.0).round() / 10.0
}

/// Hang state machine over a [`WindowProbe`].
pub struct HangDetector {
    probe: Arc<dyn WindowProbe>,
    timeout: Duration,
    records: Mutex<HashMap<u32, HangRecord>>,
    span: Span,
}

impl HangDetector {
    pub fn new(probe: Arc<dyn WindowProbe>, timeout: Duration, span: Span) -> Self {
        HangDetector {
            probe,
            timeout,
            records: Mutex::new(HashMap::new()),
            span,
        }
    }

    fn lock_records(&self) -> MutexGuard<'_, HashMap<u32, HangRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record(&self, pid: u32) -> Option<HangRecord> {
        self.lock_records().get(&pid).copied()
    }

    /// Probe `pid` and advance its state machine as of `now`.
    ///
    /// Returns the event to emit, if the transition produces one.
    pub fn check_at(&self, pid: u32, process_name: &str, now: DateTime<Utc>) -> Option<Event> {
        let _enter = self.span.enter();
        let windows = self.probe.enumerate_top_level_windows(pid);
        if windows.is_empty() {
            if self.lock_records().remove(&pid).is_some() {
                debug!(pid, "target has no windows; hang record cleared");
            }
            return None;
        }

        let hung: Vec<HungWindow> = windows
            .iter()
            .filter(|&&w| !self.probe.probe_responsive(w, self.timeout))
            .map(|&w| HungWindow {
                handle: w,
                title: self.probe.window_title(w),
            })
            .collect();
        let window_count = windows.len();

        let mut records = self.lock_records();
        let prior = records.get(&pid).copied().unwrap_or(HangRecord::Responsive);

        let base = |event_type: EventType, duration: f64, recovered: bool| {
            Event::new(event_type, process_name)
                .with_pid(pid)
                .with_timestamp(now)
                .with("duration_seconds", duration)
                .with("window_count", window_count)
                .with("recovered", recovered)
        };

        match (prior, hung.is_empty()) {
            (HangRecord::Responsive, true) => {
                records.insert(pid, HangRecord::Responsive);
                None
            }
            (HangRecord::Responsive, false) => {
                records.insert(
                    pid,
                    HangRecord::Hanging {
                        since: now,
                        reported_secs: 0.0,
                    },
                );
                warn!(pid, hung = hung.len(), windows = window_count, "target process is not responding");
                Some(base(EventType::Hang, 0.0, false).with("hung_windows", &hung))
            }
            (HangRecord::Hanging { since, reported_secs }, false) => {
                let duration = duration_tenths(since, now).max(reported_secs);
                records.insert(
                    pid,
                    HangRecord::Hanging {
                        since,
                        reported_secs: duration,
                    },
                );
                debug!(pid, duration_secs = duration, "target process still hung");
                Some(base(EventType::HangUpdate, duration, false).with("hung_windows", &hung))
            }
            (HangRecord::Hanging { since, reported_secs }, true) => {
                let duration = duration_tenths(since, now).max(reported_secs);
                records.insert(pid, HangRecord::Responsive);
                info!(pid, duration_secs = duration, "target process recovered");
                Some(base(EventType::HangRecovery, duration, true))
            }
        }
    }

    /// Drop records for every pid other than `tracked`.
    pub fn retain_tracked(&self, tracked: Option<u32>) {
        self.lock_records().retain(|&pid, _| Some(pid) == tracked);
    }

    /// One detector iteration against the watcher's current target.
    pub fn tick(&self, target: Option<&TargetProcess>, process_name: &str, sender: &EventSender) {
        self.retain_tracked(target.map(TargetProcess::pid));
        if let Some(target) = target {
            if let Some(event) = self.check_at(target.pid(), process_name, Utc::now()) {
                sender.emit(event);
            }
        }
    }

    pub fn run(
        &self,
        watcher: &ProcessWatcher,
        sender: &EventSender,
        stop: &Shutdown,
        interval: Duration,
    ) {
        info!(interval_secs = interval.as_secs(), timeout_secs = self.timeout.as_secs(), "hang detector started");
        run_periodic("hang", stop, interval, || {
            let target = watcher.tracked();
            self.tick(target.as_deref(), watcher.process_name(), sender);
            Ok::<(), std::convert::Infallible>(())
        });
        debug!("hang detector stopped");
    }
}

impl std::fmt::Debug for HangDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HangDetector")
            .field("timeout", &self.timeout)
            .field("records", &*self.lock_records())
            .finish_non_exhaustive()
    }
}
