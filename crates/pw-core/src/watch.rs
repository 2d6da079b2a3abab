//! Target process discovery, liveness and performance sampling.
//!
//! Two probes share one slot holding the tracked [`TargetProcess`]:
//!
//! - the existence probe discovers the target by name and notices when it
//!   goes away;
//! - the performance probe samples CPU, memory, thread and handle counts.
//!
//! Readers get an `Arc` snapshot of the slot. Only discovery and the lost
//! transition replace it, and the lost transition holds the slot lock from
//! the identity check until the slot is cleared, so exactly one
//! termination event is written per tracked process even when both probes
//! notice the exit at the same moment.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use pw_common::{Event, EventType, Shutdown};
use pw_telemetry::EventSender;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn, Span};

use crate::collect::{
    Liveness, ProbeError, ProcessEntry, ProcessIdentity, ProcessSample, ProcessSource,
    Termination,
};
use crate::crash::{classify, termination_event, Classification, CrashContext, ExitTaxonomy};
use crate::tasks::run_periodic;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Measurement window for the first CPU sample of a new target.
pub const FIRST_SAMPLE_WINDOW: Duration = Duration::from_secs(1);

/// The process currently being watched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetProcess {
    pub identity: ProcessIdentity,
    /// Executable name as reported by the OS.
    pub name: String,
    pub start_time: DateTime<Utc>,
}

impl TargetProcess {
    pub fn pid(&self) -> u32 {
        self.identity.pid
    }
}

impl From<ProcessEntry> for TargetProcess {
    fn from(entry: ProcessEntry) -> Self {
        TargetProcess {
            identity: entry.identity,
            name: entry.name,
            start_time: entry.start_time,
        }
    }
}

/// Metrics reported in a `performance` event.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub cpu_percent: f64,
    pub memory_rss_mb: f64,
    pub memory_vms_mb: f64,
    pub memory_percent: Option<f64>,
    pub thread_count: u32,
    pub handle_count: Option<u32>,
}

impl PerformanceMetrics {
    /// Derive metrics from two samples taken `elapsed` apart.
    pub fn from_samples(
        previous_cpu_seconds: f64,
        current: &ProcessSample,
        elapsed: Duration,
        total_memory_bytes: Option<u64>,
    ) -> Self {
        let wall = elapsed.as_secs_f64();
        let cpu_percent = if wall > 0.0 {
            ((current.cpu_seconds - previous_cpu_seconds).max(0.0) / wall) * 100.0
        } else {
            0.0
        };
        let memory_percent = total_memory_bytes
            .filter(|&total| total > 0)
            .map(|total| round2(current.rss_bytes as f64 / total as f64 * 100.0));

        PerformanceMetrics {
            cpu_percent: round2(cpu_percent),
            memory_rss_mb: round2(current.rss_bytes as f64 / BYTES_PER_MB),
            memory_vms_mb: round2(current.vms_bytes as f64 / BYTES_PER_MB),
            memory_percent,
            thread_count: current.thread_count,
            handle_count: current.handle_count,
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Last sample of the tracked process, used for CPU deltas and crash context.
#[derive(Debug, Clone)]
struct SampleCache {
    identity: ProcessIdentity,
    cpu_seconds: f64,
    taken_at: Instant,
    metrics: PerformanceMetrics,
}

/// Watcher settings.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Configured target name; used for discovery and as the event
    /// `process_name`.
    pub process_name: String,
    pub taxonomy: ExitTaxonomy,
    pub first_sample_window: Duration,
}

impl WatcherConfig {
    pub fn new(process_name: impl Into<String>) -> Self {
        WatcherConfig {
            process_name: process_name.into(),
            taxonomy: ExitTaxonomy::native(),
            first_sample_window: FIRST_SAMPLE_WINDOW,
        }
    }

    pub fn with_taxonomy(mut self, taxonomy: ExitTaxonomy) -> Self {
        self.taxonomy = taxonomy;
        self
    }

    pub fn with_first_sample_window(mut self, window: Duration) -> Self {
        self.first_sample_window = window;
        self
    }
}

/// Outcome of one existence probe.
#[derive(Debug, Clone, PartialEq)]
pub enum ExistenceOutcome {
    /// Nothing tracked and nothing found.
    Absent,
    Discovered(Arc<TargetProcess>),
    StillRunning,
    /// The tracked process was gone; carries the classification when this
    /// call emitted the termination event.
    Lost(Option<Classification>),
}

/// Owner of the target slot and both process probes.
pub struct ProcessWatcher {
    config: WatcherConfig,
    source: Arc<dyn ProcessSource>,
    sender: EventSender,
    slot: Mutex<Option<Arc<TargetProcess>>>,
    samples: Mutex<Option<SampleCache>>,
    span: Span,
}

impl ProcessWatcher {
    pub fn new(
        config: WatcherConfig,
        source: Arc<dyn ProcessSource>,
        sender: EventSender,
        span: Span,
    ) -> Self {
        ProcessWatcher {
            config,
            source,
            sender,
            slot: Mutex::new(None),
            samples: Mutex::new(None),
            span,
        }
    }

    pub fn process_name(&self) -> &str {
        &self.config.process_name
    }

    /// Snapshot of the tracked process.
    pub fn tracked(&self) -> Option<Arc<TargetProcess>> {
        self.lock_slot().clone()
    }

    fn lock_slot(&self) -> MutexGuard<'_, Option<Arc<TargetProcess>>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_samples(&self) -> MutexGuard<'_, Option<SampleCache>> {
        self.samples.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -----------------------------------------------------------------------
    // Existence probe
    // -----------------------------------------------------------------------

    /// Discover the target when untracked, otherwise check it is still alive.
    pub fn existence_tick(&self) -> Result<ExistenceOutcome, ProbeError> {
        let _enter = self.span.enter();
        let Some(target) = self.tracked() else {
            return self.discover();
        };
        match self.source.liveness(&target.identity) {
            Liveness::Running => Ok(ExistenceOutcome::StillRunning),
            Liveness::Exited(termination) => Ok(ExistenceOutcome::Lost(
                self.handle_lost(&target.identity, termination),
            )),
        }
    }

    fn discover(&self) -> Result<ExistenceOutcome, ProbeError> {
        let Some(entry) = self.source.find_by_name(&self.config.process_name)? else {
            debug!(process = %self.config.process_name, "target process not running");
            return Ok(ExistenceOutcome::Absent);
        };

        let target = Arc::new(TargetProcess::from(entry));
        {
            let mut slot = self.lock_slot();
            if let Some(existing) = slot.as_ref() {
                // Lost the race against another discovery.
                return Ok(if existing.identity == target.identity {
                    ExistenceOutcome::StillRunning
                } else {
                    ExistenceOutcome::Absent
                });
            }
            *slot = Some(Arc::clone(&target));
        }

        info!(pid = target.pid(), name = %target.name, "found target process");
        self.sender.emit(
            Event::new(EventType::ProcessStarted, &self.config.process_name)
                .with_pid(target.pid())
                .with("create_time", target.start_time)
                .with("executable", &target.name),
        );
        Ok(ExistenceOutcome::Discovered(target))
    }

    // -----------------------------------------------------------------------
    // Performance probe
    // -----------------------------------------------------------------------

    /// Sample the tracked process and emit a `performance` event.
    ///
    /// The first sample of a target blocks for the first-sample window (or
    /// until `stop` fires) to get a CPU delta. Returns `None` when nothing
    /// was sampled.
    pub fn performance_tick(
        &self,
        stop: &Shutdown,
    ) -> Result<Option<PerformanceMetrics>, ProbeError> {
        let _enter = self.span.enter();
        let Some(target) = self.tracked() else {
            return Ok(None);
        };
        let identity = target.identity;

        let baseline = self
            .lock_samples()
            .as_ref()
            .filter(|cache| cache.identity == identity)
            .map(|cache| (cache.cpu_seconds, cache.taken_at));

        let (previous_cpu, previous_at) = match baseline {
            Some(baseline) => baseline,
            None => {
                let first = match self.sample_or_lose(&identity)? {
                    Some(sample) => sample,
                    None => return Ok(None),
                };
                let at = Instant::now();
                if stop.wait_timeout(self.config.first_sample_window) {
                    return Ok(None);
                }
                (first.cpu_seconds, at)
            }
        };

        let Some(sample) = self.sample_or_lose(&identity)? else {
            return Ok(None);
        };
        let now = Instant::now();
        let metrics = PerformanceMetrics::from_samples(
            previous_cpu,
            &sample,
            now.duration_since(previous_at),
            self.source.total_memory_bytes(),
        );

        // Check and emit under the slot lock: no performance record may
        // follow the target's termination record.
        let slot = self.lock_slot();
        if slot.as_ref().map(|t| t.identity) != Some(identity) {
            return Ok(None);
        }
        *self.lock_samples() = Some(SampleCache {
            identity,
            cpu_seconds: sample.cpu_seconds,
            taken_at: now,
            metrics,
        });

        debug!(pid = identity.pid, cpu = metrics.cpu_percent, rss_mb = metrics.memory_rss_mb, "performance sample");
        self.sender.emit(
            Event::new(EventType::Performance, &self.config.process_name)
                .with_pid(identity.pid)
                .with("metrics", metrics),
        );
        drop(slot);
        Ok(Some(metrics))
    }

    /// Sample, routing a vanished process through the lost transition.
    fn sample_or_lose(&self, identity: &ProcessIdentity) -> Result<Option<ProcessSample>, ProbeError> {
        match self.source.sample(identity) {
            Ok(sample) => Ok(Some(sample)),
            Err(e) => match self.source.liveness(identity) {
                Liveness::Exited(termination) => {
                    debug!(pid = identity.pid, error = %e, "sample failed on exited process");
                    self.handle_lost(identity, termination);
                    Ok(None)
                }
                Liveness::Running if matches!(e, ProbeError::NotFound { .. }) => {
                    self.handle_lost(identity, Termination::Unknown);
                    Ok(None)
                }
                Liveness::Running => Err(e),
            },
        }
    }

    // -----------------------------------------------------------------------
    // Lost transition
    // -----------------------------------------------------------------------

    /// Emit the termination event for `identity` and clear the slot.
    ///
    /// Does nothing (returns `None`) if the slot no longer holds `identity`,
    /// which is how a second caller racing on the same exit is absorbed.
    pub fn handle_lost(
        &self,
        identity: &ProcessIdentity,
        termination: Termination,
    ) -> Option<Classification> {
        let mut slot = self.lock_slot();
        let target = match slot.as_ref() {
            Some(target) if target.identity == *identity => Arc::clone(target),
            _ => return None,
        };

        let last_metrics = self
            .lock_samples()
            .take()
            .filter(|cache| cache.identity == *identity)
            .map(|cache| cache.metrics);
        let context = CrashContext::capture(&target, last_metrics, Utc::now());
        let classification = classify(termination, self.config.taxonomy);

        let mut event = termination_event(&target, termination, &classification, &context);
        event.process_name = self.config.process_name.clone();
        self.sender.emit(event);

        if classification.is_crash() {
            error!(
                pid = identity.pid,
                kind = %classification.kind,
                description = %classification.description,
                uptime_secs = context.uptime_seconds,
                "target process crashed"
            );
        } else {
            warn!(
                pid = identity.pid,
                kind = %classification.kind,
                description = %classification.description,
                "target process terminated"
            );
        }

        self.source.forget(identity);
        *slot = None;
        Some(classification)
    }

    // -----------------------------------------------------------------------
    // Worker loops
    // -----------------------------------------------------------------------

    pub fn run_existence(&self, stop: &Shutdown, interval: Duration) {
        info!(interval_secs = interval.as_secs(), "existence probe started");
        run_periodic("existence", stop, interval, || self.existence_tick().map(|_| ()));
        debug!("existence probe stopped");
    }

    pub fn run_performance(&self, stop: &Shutdown, interval: Duration) {
        info!(interval_secs = interval.as_secs(), "performance probe started");
        run_periodic("performance", stop, interval, || {
            self.performance_tick(stop).map(|_| ())
        });
        debug!("performance probe stopped");
    }
}

impl std::fmt::Debug for ProcessWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessWatcher")
            .field("config", &self.config)
            .field("tracked", &self.tracked())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crash::TerminationKind;
    use crate::test_utils::MockProcessSource;
    use pw_telemetry::{bounded, Dequeue, EventReceiver, Statistics};

    fn watcher(source: Arc<MockProcessSource>) -> (ProcessWatcher, EventReceiver) {
        let (tx, rx) = bounded(64, Arc::new(Statistics::new()));
        let config = WatcherConfig::new("YourPOSApp.exe")
            .with_taxonomy(ExitTaxonomy::Windows)
            .with_first_sample_window(Duration::from_millis(10));
        (ProcessWatcher::new(config, source, tx, Span::none()), rx)
    }

    fn drain(rx: &EventReceiver) -> Vec<Event> {
        let mut out = Vec::new();
        while let Dequeue::Event(e) = rx.try_dequeue() {
            out.push(e);
        }
        out
    }

    #[test]
    fn discovery_emits_process_started() {
        let source = Arc::new(MockProcessSource::new());
        let (w, rx) = watcher(Arc::clone(&source));

        assert_eq!(w.existence_tick().unwrap(), ExistenceOutcome::Absent);
        assert!(drain(&rx).is_empty());

        source.spawn(100, "yourposapp.exe");
        assert!(matches!(w.existence_tick().unwrap(), ExistenceOutcome::Discovered(_)));
        assert_eq!(w.existence_tick().unwrap(), ExistenceOutcome::StillRunning);

        let events = drain(&rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::ProcessStarted);
        assert_eq!(events[0].pid, Some(100));
        assert_eq!(events[0].process_name, "YourPOSApp.exe");
        assert!(events[0].get("create_time").is_some());
    }

    #[test]
    fn crash_is_classified_and_slot_cleared() {
        let source = Arc::new(MockProcessSource::new());
        let (w, rx) = watcher(Arc::clone(&source));
        source.spawn(100, "YourPOSApp.exe");
        w.existence_tick().unwrap();

        source.exit(100, Termination::ExitCode(-1073741819));
        let outcome = w.existence_tick().unwrap();
        let ExistenceOutcome::Lost(Some(c)) = outcome else {
            panic!("expected lost transition, got {outcome:?}");
        };
        assert_eq!(c.kind, TerminationKind::Crash);
        assert!(w.tracked().is_none());

        let events = drain(&rx);
        let crash = events.last().unwrap();
        assert_eq!(crash.event_type, EventType::Crash);
        assert_eq!(crash.get("classification").unwrap()["description"], "Access violation");
        assert!(crash.get("crash_context").unwrap()["uptime_seconds"].is_number());
    }

    #[test]
    fn lost_transition_fires_once() {
        let source = Arc::new(MockProcessSource::new());
        let (w, rx) = watcher(Arc::clone(&source));
        source.spawn(100, "YourPOSApp.exe");
        w.existence_tick().unwrap();
        let identity = w.tracked().unwrap().identity;
        drain(&rx);

        let w = Arc::new(w);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let w = Arc::clone(&w);
                std::thread::spawn(move || w.handle_lost(&identity, Termination::ExitCode(0)))
            })
            .collect();
        let fired = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .count();
        assert_eq!(fired, 1);

        let events = drain(&rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::ProcessTerminated);
    }

    #[test]
    fn pid_reuse_is_a_lost_process() {
        let source = Arc::new(MockProcessSource::new());
        let (w, rx) = watcher(Arc::clone(&source));
        source.spawn(100, "YourPOSApp.exe");
        w.existence_tick().unwrap();

        // Same pid, new start token.
        source.respawn_same_pid(100);
        let outcome = w.existence_tick().unwrap();
        let ExistenceOutcome::Lost(Some(c)) = outcome else {
            panic!("expected lost transition, got {outcome:?}");
        };
        assert_eq!(c.kind, TerminationKind::Unknown);
        let events = drain(&rx);
        assert_eq!(events.last().unwrap().event_type, EventType::ProcessTerminated);

        // The new process is picked up on the next probe.
        assert!(matches!(w.existence_tick().unwrap(), ExistenceOutcome::Discovered(_)));
    }

    #[test]
    fn performance_sample_reports_metrics() {
        let source = Arc::new(MockProcessSource::new());
        let (w, rx) = watcher(Arc::clone(&source));
        source.spawn(100, "YourPOSApp.exe");
        source.set_sample(
            100,
            ProcessSample {
                cpu_seconds: 1.0,
                rss_bytes: 100 * 1024 * 1024,
                vms_bytes: 200 * 1024 * 1024,
                thread_count: 5,
                handle_count: Some(40),
            },
        );
        w.existence_tick().unwrap();
        drain(&rx);

        let stop = Shutdown::new();
        let metrics = w.performance_tick(&stop).unwrap().unwrap();
        assert_eq!(metrics.memory_rss_mb, 100.0);
        assert_eq!(metrics.memory_vms_mb, 200.0);
        assert_eq!(metrics.thread_count, 5);
        assert_eq!(metrics.handle_count, Some(40));
        assert_eq!(metrics.memory_percent, Some(1.22));

        let events = drain(&rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Performance);
        assert_eq!(events[0].get("metrics").unwrap()["thread_count"], 5);
    }

    #[test]
    fn crash_context_includes_last_metrics() {
        let source = Arc::new(MockProcessSource::new());
        let (w, rx) = watcher(Arc::clone(&source));
        source.spawn(100, "YourPOSApp.exe");
        w.existence_tick().unwrap();
        w.performance_tick(&Shutdown::new()).unwrap();
        drain(&rx);

        source.exit(100, Termination::ExitCode(1));
        w.existence_tick().unwrap();
        let events = drain(&rx);
        let ctx = events[0].get("crash_context").unwrap();
        assert!(ctx["last_metrics"].is_object());
    }

    #[test]
    fn failed_sample_routes_through_lost_transition() {
        let source = Arc::new(MockProcessSource::new());
        let (w, rx) = watcher(Arc::clone(&source));
        source.spawn(100, "YourPOSApp.exe");
        w.existence_tick().unwrap();
        drain(&rx);

        source.exit(100, Termination::ExitCode(0xC00000FD_u32 as i32 as i64));
        assert_eq!(w.performance_tick(&Shutdown::new()).unwrap(), None);
        assert!(w.tracked().is_none());
        let events = drain(&rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Crash);
    }

    #[test]
    fn performance_never_follows_termination() {
        for _ in 0..50 {
            let source = Arc::new(MockProcessSource::new());
            let (w, rx) = watcher(Arc::clone(&source));
            source.spawn(100, "YourPOSApp.exe");
            w.existence_tick().unwrap();
            w.performance_tick(&Shutdown::new()).unwrap();
            let identity = w.tracked().unwrap().identity;
            drain(&rx);

            let w = Arc::new(w);
            let sampler = {
                let w = Arc::clone(&w);
                std::thread::spawn(move || w.performance_tick(&Shutdown::new()))
            };
            w.handle_lost(&identity, Termination::ExitCode(0));
            sampler.join().unwrap().unwrap();

            let events = drain(&rx);
            assert_eq!(events.last().unwrap().event_type, EventType::ProcessTerminated);
            assert!(w.lock_samples().is_none(), "no cache for a lost target");
        }
    }

    #[test]
    fn cpu_percent_from_deltas() {
        let sample = ProcessSample {
            cpu_seconds: 3.0,
            rss_bytes: 0,
            vms_bytes: 0,
            thread_count: 1,
            handle_count: None,
        };
        let m = PerformanceMetrics::from_samples(2.5, &sample, Duration::from_secs(1), None);
        assert_eq!(m.cpu_percent, 50.0);
        assert_eq!(m.memory_percent, None);
        let m = PerformanceMetrics::from_samples(2.5, &sample, Duration::ZERO, Some(0));
        assert_eq!(m.cpu_percent, 0.0);
        assert_eq!(m.memory_percent, None);
    }
}
