//! Agent lifecycle.
//!
//! The [`Agent`] owns the telemetry pipeline and every producer thread:
//!
//! - existence and performance probes ([`ProcessWatcher`])
//! - the hang detector, when a window probe is available and enabled
//! - the event-source poller, when one is configured
//! - the self monitor
//!
//! Shutdown order is fixed: producers are signalled and joined (bounded),
//! `monitor_stopped` is enqueued, then the writer drains the queue, flushes
//! and is joined together with the retention sweeper.

use std::convert::Infallible;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use pw_common::{join_timeout, AgentConfig, ConfigSnapshot, Event, EventType, Shutdown};
use pw_telemetry::{EventSender, StatsSnapshot, Telemetry, TelemetryHandle, WriteError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::collect::{native_source, ProbeError, ProcessSource};
use crate::eventlog::{EventSource, LogFileSource};
use crate::hang::{native_probe, HangDetector, WindowProbe};
use crate::logging::{component_span, generate_run_id};
use crate::selfmon::{ResourceLimits, SelfMonitor};
use crate::tasks::{run_periodic, spawn_worker};
use crate::watch::{ProcessWatcher, WatcherConfig};

/// Errors from agent startup.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("configuration error: {0}")]
    Config(#[from] pw_common::Error),

    #[error("telemetry pipeline failed to start: {0}")]
    Telemetry(#[from] WriteError),

    #[error("process probing unavailable: {0}")]
    Probe(#[from] ProbeError),

    #[error("failed to spawn {task} thread: {source}")]
    Spawn {
        task: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("agent is already running")]
    AlreadyRunning,

    #[error("gave up after {attempts} failed starts: {last}")]
    RestartsExhausted { attempts: u32, last: Box<AgentError> },
}

impl AgentError {
    /// Whether a later start attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AgentError::Telemetry(_) | AgentError::Spawn { .. } | AgentError::Probe(_)
        )
    }
}

/// The process currently being watched, as reported by [`Agent::status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedProcess {
    pub pid: u32,
    pub name: String,
    pub start_time: DateTime<Utc>,
}

/// Point-in-time agent status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub running: bool,
    pub run_id: String,
    pub stats: StatsSnapshot,
    pub queue_depth: usize,
    pub buffer_len: usize,
    pub tracked: Option<TrackedProcess>,
}

struct Running {
    telemetry: TelemetryHandle,
    sender: EventSender,
    producers: Shutdown,
    workers: Vec<(&'static str, JoinHandle<()>)>,
    watcher: Arc<ProcessWatcher>,
    started_at: Instant,
}

/// The monitoring agent.
pub struct Agent {
    config: AgentConfig,
    run_id: String,
    snapshot: Option<ConfigSnapshot>,
    source: Arc<dyn ProcessSource>,
    probe: Option<Arc<dyn WindowProbe>>,
    event_source: Option<Arc<Mutex<Box<dyn EventSource>>>>,
    running: Mutex<Option<Running>>,
    last_status: Mutex<Option<AgentStatus>>,
    stop_requested: Shutdown,
}

impl Agent {
    /// Build an agent on the platform's native process and window probes.
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        let source = native_source()?;
        let probe = native_probe();
        Ok(Self::with_capabilities(config, source, probe))
    }

    /// Build an agent on explicit capabilities.
    pub fn with_capabilities(
        config: AgentConfig,
        source: Arc<dyn ProcessSource>,
        probe: Option<Arc<dyn WindowProbe>>,
    ) -> Self {
        let run_id = generate_run_id();
        let event_source = (config.event_log.enabled && !config.event_log.sources.is_empty())
            .then(|| {
                let tailer = LogFileSource::new(
                    &config.monitor.process_name,
                    &config.event_log,
                    component_span("eventlog", &run_id),
                );
                Arc::new(Mutex::new(Box::new(tailer) as Box<dyn EventSource>))
            });
        Agent {
            config,
            run_id,
            snapshot: None,
            source,
            probe,
            event_source,
            running: Mutex::new(None),
            last_status: Mutex::new(None),
            stop_requested: Shutdown::new(),
        }
    }

    /// Replace the configured event source.
    pub fn with_event_source(mut self, source: Box<dyn EventSource>) -> Self {
        self.event_source = Some(Arc::new(Mutex::new(source)));
        self
    }

    /// Record where the configuration came from; logged in `monitor_started`.
    pub fn with_snapshot(mut self, snapshot: ConfigSnapshot) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Start every task and block until a stop is requested, then stop.
    pub fn start(&self) -> Result<AgentStatus, AgentError> {
        self.spawn()?;
        self.stop_requested.wait();
        Ok(self.stop().unwrap_or_else(|| self.status()))
    }

    /// Ask a blocked [`Agent::start`] to shut down. Safe from a signal
    /// handler thread.
    pub fn request_stop(&self) {
        self.stop_requested.trigger();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested.is_triggered()
    }

    /// Start every task without blocking.
    pub fn spawn(&self) -> Result<(), AgentError> {
        let mut running = self.lock_running();
        if running.is_some() {
            return Err(AgentError::AlreadyRunning);
        }
        self.config.validate_for_run()?;

        let span = component_span("supervisor", &self.run_id);
        let _enter = span.enter();

        let telemetry = Telemetry::from_agent(&self.config).start()?;
        let sender = telemetry.sender();
        self.emit_started(&sender);

        let producers = Shutdown::new();
        let watcher = Arc::new(ProcessWatcher::new(
            WatcherConfig::new(&self.config.monitor.process_name),
            Arc::clone(&self.source),
            sender.clone(),
            component_span("watcher", &self.run_id),
        ));

        let mut workers = Vec::new();
        if let Err(e) = self.spawn_workers(&watcher, &sender, &producers, &mut workers) {
            producers.trigger();
            for (_, handle) in workers {
                let _ = join_timeout(handle, self.config.shutdown_timeout());
            }
            telemetry.shutdown(self.config.shutdown_timeout());
            return Err(e);
        }

        info!(
            process = %self.config.monitor.process_name,
            log_dir = %self.config.log_dir().display(),
            workers = workers.len(),
            "agent started"
        );
        *running = Some(Running {
            telemetry,
            sender,
            producers,
            workers,
            watcher,
            started_at: Instant::now(),
        });
        Ok(())
    }

    fn emit_started(&self, sender: &EventSender) {
        let mut event = Event::new(EventType::MonitorStarted, &self.config.monitor.process_name)
            .with_pid(std::process::id())
            .with("run_id", &self.run_id)
            .with("version", env!("CARGO_PKG_VERSION"))
            .with("hang_detection", self.hang_enabled())
            .with("event_source", self.event_source.is_some());
        if let Some(snapshot) = &self.snapshot {
            event.insert("config", snapshot.describe());
            event.insert("config_hash", &snapshot.hash);
        }
        sender.emit(event);
    }

    fn hang_enabled(&self) -> bool {
        self.config.monitor.hang_detection && self.probe.is_some()
    }

    fn spawn_workers(
        &self,
        watcher: &Arc<ProcessWatcher>,
        sender: &EventSender,
        stop: &Shutdown,
        workers: &mut Vec<(&'static str, JoinHandle<()>)>,
    ) -> Result<(), AgentError> {
        let run_id = self.run_id.as_str();
        let mut spawn = |task: &'static str, thread: &str, body: Box<dyn FnOnce() + Send>| {
            spawn_worker(thread, component_span(task, run_id), body)
                .map(|handle| workers.push((task, handle)))
                .map_err(|source| AgentError::Spawn { task, source })
        };

        {
            let (w, stop, interval) = (Arc::clone(watcher), stop.clone(), self.config.process_check_interval());
            spawn("existence", "pw-existence", Box::new(move || w.run_existence(&stop, interval)))?;
        }
        {
            let (w, stop, interval) = (Arc::clone(watcher), stop.clone(), self.config.performance_interval());
            spawn("performance", "pw-performance", Box::new(move || w.run_performance(&stop, interval)))?;
        }

        match &self.probe {
            Some(probe) if self.config.monitor.hang_detection => {
                let detector = HangDetector::new(
                    Arc::clone(probe),
                    self.config.hang_timeout(),
                    component_span("hang", run_id),
                );
                let (w, tx, stop, interval) = (
                    Arc::clone(watcher),
                    sender.clone(),
                    stop.clone(),
                    self.config.hang_check_interval(),
                );
                spawn("hang", "pw-hang", Box::new(move || detector.run(&w, &tx, &stop, interval)))?;
            }
            Some(_) => debug!("hang detection disabled by configuration"),
            None => debug!("no window probe on this platform; hang detection off"),
        }

        if let Some(source) = &self.event_source {
            let (source, tx, stop, interval) = (
                Arc::clone(source),
                sender.clone(),
                stop.clone(),
                self.config.event_poll_interval(),
            );
            spawn(
                "eventlog",
                "pw-eventlog",
                Box::new(move || poll_event_source(&source, &tx, &stop, interval)),
            )?;
        }

        if self.config.monitor.monitor_self {
            let monitor = SelfMonitor::new(
                Arc::clone(&self.source),
                sender.clone(),
                ResourceLimits::from_agent(&self.config),
                &self.config.monitor.process_name,
                component_span("selfmon", run_id),
            );
            let (stop, interval) = (stop.clone(), self.config.self_monitor_interval());
            spawn("selfmon", "pw-selfmon", Box::new(move || monitor.run(&stop, interval)))?;
        }
        Ok(())
    }

    /// Stop every task and flush telemetry. Returns the final status, or
    /// `None` if the agent was not running. Idempotent.
    pub fn stop(&self) -> Option<AgentStatus> {
        self.stop_requested.trigger();
        let running = self.lock_running().take()?;

        let span = component_span("supervisor", &self.run_id);
        let _enter = span.enter();
        info!("stopping agent");

        let timeout = self.config.shutdown_timeout();
        let deadline = Instant::now() + timeout;
        running.producers.trigger();
        for (task, handle) in running.workers {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match join_timeout(handle, remaining) {
                Some(Ok(())) => {}
                Some(Err(_)) => error!(task, "worker thread panicked"),
                None => warn!(task, "worker did not stop in time; detaching"),
            }
        }

        let tracked = tracked_status(&running.watcher);
        running.sender.emit(
            Event::new(EventType::MonitorStopped, &self.config.monitor.process_name)
                .with_pid(std::process::id())
                .with("run_id", &self.run_id)
                .with("uptime_seconds", running.started_at.elapsed().as_secs_f64())
                .with("tracked_pid", tracked.as_ref().map(|t| t.pid)),
        );
        drop(running.sender);

        let telemetry = running.telemetry.shutdown(timeout);
        let status = AgentStatus {
            running: false,
            run_id: self.run_id.clone(),
            stats: telemetry.stats,
            queue_depth: telemetry.queue_depth,
            buffer_len: telemetry.buffer_len,
            tracked,
        };
        info!(
            written = status.stats.entries_written,
            dropped = status.stats.entries_dropped,
            write_errors = status.stats.write_errors,
            "agent stopped"
        );
        *self.last_status.lock().unwrap_or_else(|e| e.into_inner()) = Some(status.clone());
        Some(status)
    }

    /// Current status; safe to call from any thread at any time.
    pub fn status(&self) -> AgentStatus {
        if let Some(running) = self.lock_running().as_ref() {
            let telemetry = running.telemetry.status();
            return AgentStatus {
                running: true,
                run_id: self.run_id.clone(),
                stats: telemetry.stats,
                queue_depth: telemetry.queue_depth,
                buffer_len: telemetry.buffer_len,
                tracked: tracked_status(&running.watcher),
            };
        }
        self.last_status
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_else(|| AgentStatus {
                run_id: self.run_id.clone(),
                ..AgentStatus::default()
            })
    }

    /// Service entry point: start, retrying failed starts up to
    /// `max_restarts` times with `restart_delay` between attempts.
    pub fn run_with_restarts(&self) -> Result<AgentStatus, AgentError> {
        let max_restarts = self.config.monitor.max_restarts;
        let delay = self.config.restart_delay();
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let err = match self.start() {
                Ok(status) => return Ok(status),
                Err(e) => e,
            };
            if !err.is_retryable() {
                return Err(err);
            }
            if attempts > max_restarts {
                error!(attempts, error = %err, "agent failed to start; giving up");
                return Err(AgentError::RestartsExhausted {
                    attempts,
                    last: Box::new(err),
                });
            }
            error!(
                attempt = attempts,
                max_restarts,
                delay_secs = delay.as_secs(),
                error = %err,
                "agent failed to start; retrying"
            );
            if self.stop_requested.wait_timeout(delay) {
                info!("stop requested while waiting to restart");
                return Ok(self.status());
            }
        }
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("run_id", &self.run_id)
            .field("process", &self.config.monitor.process_name)
            .finish_non_exhaustive()
    }
}

fn tracked_status(watcher: &ProcessWatcher) -> Option<TrackedProcess> {
    watcher.tracked().map(|t| TrackedProcess {
        pid: t.pid(),
        name: t.name.clone(),
        start_time: t.start_time,
    })
}

fn poll_event_source(
    source: &Mutex<Box<dyn EventSource>>,
    sender: &EventSender,
    stop: &Shutdown,
    interval: Duration,
) {
    let name = source
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .name()
        .to_string();
    info!(source = %name, interval_secs = interval.as_secs(), "event source poller started");
    run_periodic("eventlog", stop, interval, || {
        let events = source.lock().unwrap_or_else(|e| e.into_inner()).poll();
        for event in events {
            sender.emit(event);
        }
        Ok::<(), Infallible>(())
    });
    debug!(source = %name, "event source poller stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::Termination;
    use crate::test_utils::{MockProcessSource, MockWindowProbe};
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> AgentConfig {
        let mut config = AgentConfig::default();
        config.monitor.process_name = "YourPOSApp.exe".to_string();
        config.monitor.process_check_interval_seconds = 1;
        config.monitor.performance_interval_seconds = 1;
        config.monitor.max_restarts = 2;
        config.monitor.restart_delay_seconds = 0;
        config.monitor.log_dir = Some(dir.path().to_path_buf());
        config
    }

    fn agent(config: AgentConfig) -> (Agent, Arc<MockProcessSource>) {
        let source = Arc::new(MockProcessSource::new());
        let probe = Arc::new(MockWindowProbe::new());
        let agent = Agent::with_capabilities(
            config,
            Arc::clone(&source) as Arc<dyn ProcessSource>,
            Some(probe as Arc<dyn WindowProbe>),
        );
        (agent, source)
    }

    #[test]
    fn agent_is_send_and_sync() {
        fn check<T: Send + Sync>() {}
        check::<Agent>();
    }

    #[test]
    fn missing_process_name_is_not_retried() {
        let dir = TempDir::new().unwrap();
        let mut cfg = config(&dir);
        cfg.monitor.process_name.clear();
        let (agent, _) = agent(cfg);
        let err = agent.run_with_restarts().unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn spawn_twice_is_rejected_and_stop_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (agent, _) = agent(config(&dir));
        agent.spawn().unwrap();
        assert!(matches!(agent.spawn(), Err(AgentError::AlreadyRunning)));
        assert!(agent.status().running);

        let status = agent.stop().unwrap();
        assert!(!status.running);
        assert!(status.stats.entries_written >= 2);
        assert!(agent.stop().is_none());
        assert_eq!(agent.status(), status);
    }

    #[test]
    fn status_reports_tracked_process() {
        let dir = TempDir::new().unwrap();
        let (agent, source) = agent(config(&dir));
        source.spawn(4242, "YourPOSApp.exe");
        agent.spawn().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while agent.status().tracked.is_none() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(agent.status().tracked.map(|t| t.pid), Some(4242));

        source.exit(4242, Termination::ExitCode(0));
        let status = agent.stop().unwrap();
        assert!(status.stats.entries_written >= 3);
    }

    #[test]
    fn request_stop_unblocks_start() {
        let dir = TempDir::new().unwrap();
        let (agent, _) = agent(config(&dir));
        let agent = Arc::new(agent);
        let waiter = {
            let agent = Arc::clone(&agent);
            std::thread::spawn(move || agent.start())
        };
        std::thread::sleep(Duration::from_millis(100));
        agent.request_stop();
        let status = waiter.join().unwrap().unwrap();
        assert!(!status.running);
        assert_eq!(status.run_id, agent.run_id());
    }
}
