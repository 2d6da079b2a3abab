//! The agent's own resource usage.
//!
//! Each tick samples the agent process through the same
//! [`ProcessSource`] used for the target, emits a `self_monitor` event with
//! the metrics and the telemetry counters, and a `resource_limit_exceeded`
//! event for every configured limit that is over.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use pw_common::{AgentConfig, Event, EventType, Shutdown};
use pw_telemetry::EventSender;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn, Span};

use crate::collect::{ProbeError, ProcessEntry, ProcessSource};
use crate::tasks::run_periodic;
use crate::watch::PerformanceMetrics;

/// Resource ceilings for the agent process.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub max_memory_mb: f64,
    pub max_cpu_percent: f64,
}

impl ResourceLimits {
    pub fn from_agent(config: &AgentConfig) -> Self {
        ResourceLimits {
            max_memory_mb: config.monitor.max_memory_mb,
            max_cpu_percent: config.monitor.max_cpu_percent,
        }
    }

    /// `(resource, value, limit)` for every exceeded limit.
    pub fn violations(&self, metrics: &PerformanceMetrics) -> Vec<(&'static str, f64, f64)> {
        let mut out = Vec::new();
        if metrics.memory_rss_mb > self.max_memory_mb {
            out.push(("memory_mb", metrics.memory_rss_mb, self.max_memory_mb));
        }
        if metrics.cpu_percent > self.max_cpu_percent {
            out.push(("cpu_percent", metrics.cpu_percent, self.max_cpu_percent));
        }
        out
    }
}

struct Baseline {
    cpu_seconds: f64,
    at: Instant,
}

/// Periodic self-check.
pub struct SelfMonitor {
    source: Arc<dyn ProcessSource>,
    sender: EventSender,
    limits: ResourceLimits,
    process_name: String,
    pid: u32,
    own: Mutex<Option<(ProcessEntry, Baseline)>>,
    span: Span,
}

impl SelfMonitor {
    pub fn new(
        source: Arc<dyn ProcessSource>,
        sender: EventSender,
        limits: ResourceLimits,
        process_name: impl Into<String>,
        span: Span,
    ) -> Self {
        Self::for_pid(source, sender, limits, process_name, std::process::id(), span)
    }

    /// Monitor `pid` instead of the current process.
    pub fn for_pid(
        source: Arc<dyn ProcessSource>,
        sender: EventSender,
        limits: ResourceLimits,
        process_name: impl Into<String>,
        pid: u32,
        span: Span,
    ) -> Self {
        SelfMonitor {
            source,
            sender,
            limits,
            process_name: process_name.into(),
            pid,
            own: Mutex::new(None),
            span,
        }
    }

    /// Sample once and emit the resulting events.
    pub fn tick(&self) -> Result<PerformanceMetrics, ProbeError> {
        let _enter = self.span.enter();
        let mut own = self.own.lock().unwrap_or_else(|e| e.into_inner());
        if own.is_none() {
            let entry = self.source.identify(self.pid)?;
            let lifetime = (Utc::now() - entry.start_time).to_std().unwrap_or_default();
            // Lifetime average for the first reading.
            let at = Instant::now().checked_sub(lifetime).unwrap_or_else(Instant::now);
            *own = Some((entry, Baseline { cpu_seconds: 0.0, at }));
        }
        let Some((entry, baseline)) = own.as_mut() else {
            return Err(ProbeError::NotFound { pid: self.pid });
        };

        let sample = self.source.sample(&entry.identity)?;
        let now = Instant::now();
        let metrics = PerformanceMetrics::from_samples(
            baseline.cpu_seconds,
            &sample,
            now.duration_since(baseline.at),
            self.source.total_memory_bytes(),
        );
        *baseline = Baseline {
            cpu_seconds: sample.cpu_seconds,
            at: now,
        };
        drop(own);

        debug!(rss_mb = metrics.memory_rss_mb, cpu = metrics.cpu_percent, "self sample");
        self.sender.emit(
            Event::new(EventType::SelfMonitor, &self.process_name)
                .with_pid(self.pid)
                .with("metrics", metrics)
                .with("limits", self.limits)
                .with("telemetry", self.sender.stats().snapshot()),
        );

        for (resource, value, limit) in self.limits.violations(&metrics) {
            warn!(resource, value, limit, "agent resource limit exceeded");
            self.sender.emit(
                Event::new(EventType::ResourceLimitExceeded, &self.process_name)
                    .with_pid(self.pid)
                    .with("resource", resource)
                    .with("value", value)
                    .with("limit", limit),
            );
        }
        Ok(metrics)
    }

    pub fn run(&self, stop: &Shutdown, interval: Duration) {
        info!(interval_secs = interval.as_secs(), "self monitor started");
        run_periodic("self-monitor", stop, interval, || self.tick().map(|_| ()));
        debug!("self monitor stopped");
    }
}
