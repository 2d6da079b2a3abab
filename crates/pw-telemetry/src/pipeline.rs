//! Wiring of queue, writer and sweeper into running threads.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use pw_common::{join_timeout, AgentConfig, Shutdown};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::queue::{bounded, EventSender};
use crate::retention::RetentionSweeper;
use crate::stats::{Statistics, StatsSnapshot};
use crate::writer::{BatchWriter, WriteError, WriterConfig};

/// Point-in-time pipeline status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryStatus {
    pub stats: StatsSnapshot,
    pub queue_depth: usize,
    pub buffer_len: usize,
    pub writer_running: bool,
}

/// Pipeline settings independent of the agent config.
#[derive(Debug, Clone)]
pub struct Telemetry {
    pub writer: WriterConfig,
    pub queue_capacity: usize,
    pub retention: Duration,
    pub sweep_interval: Duration,
}

impl Telemetry {
    pub fn from_agent(config: &AgentConfig) -> Self {
        Telemetry {
            writer: WriterConfig::from_agent(config),
            queue_capacity: config.logging.queue_capacity,
            retention: config.retention(),
            sweep_interval: config.retention_sweep_interval(),
        }
    }

    /// Spawn the writer and sweeper threads.
    pub fn start(self) -> Result<TelemetryHandle, WriteError> {
        let stats = Arc::new(Statistics::new());
        let (sender, receiver) = bounded(self.queue_capacity, Arc::clone(&stats));
        let writer = BatchWriter::new(self.writer.clone(), Arc::clone(&stats))?;
        let stop = Shutdown::new();

        let writer_thread = {
            let stop = stop.clone();
            thread::Builder::new()
                .name("pw-writer".to_string())
                .spawn(move || writer.run(&receiver, &stop))?
        };

        let sweeper = RetentionSweeper::new(self.writer.layout(), self.retention)
            .with_stats(Arc::clone(&stats));
        let sweep_interval = self.sweep_interval;
        let sweeper_thread = {
            let stop = stop.clone();
            thread::Builder::new()
                .name("pw-retention".to_string())
                .spawn(move || sweeper.run(&stop, sweep_interval))
        };
        let sweeper_thread = match sweeper_thread {
            Ok(handle) => handle,
            Err(e) => {
                stop.trigger();
                let _ = writer_thread.join();
                return Err(e.into());
            }
        };

        Ok(TelemetryHandle {
            sender,
            stats,
            stop,
            writer: Some(writer_thread),
            sweeper: Some(sweeper_thread),
        })
    }
}

/// Owner of the running pipeline threads.
#[derive(Debug)]
pub struct TelemetryHandle {
    sender: EventSender,
    stats: Arc<Statistics>,
    stop: Shutdown,
    writer: Option<JoinHandle<Result<usize, WriteError>>>,
    sweeper: Option<JoinHandle<()>>,
}

impl TelemetryHandle {
    /// New producer handle.
    pub fn sender(&self) -> EventSender {
        self.sender.clone()
    }

    pub fn stats(&self) -> Arc<Statistics> {
        Arc::clone(&self.stats)
    }

    pub fn status(&self) -> TelemetryStatus {
        let stats = self.stats.snapshot();
        TelemetryStatus {
            stats,
            queue_depth: stats.queue_depth,
            buffer_len: stats.buffered,
            writer_running: self.writer.as_ref().is_some_and(|h| !h.is_finished()),
        }
    }

    /// Stop the writer (which drains the queue and flushes) and the
    /// sweeper, waiting at most `timeout` for each.
    pub fn shutdown(mut self, timeout: Duration) -> TelemetryStatus {
        self.stop.trigger();
        if let Some(handle) = self.writer.take() {
            match join_timeout(handle, timeout) {
                Some(Ok(Ok(_))) => {}
                Some(Ok(Err(e))) => error!(error = %e, "writer finished with an unflushed batch"),
                Some(Err(_)) => error!("writer thread panicked"),
                None => warn!(timeout_secs = timeout.as_secs(), "writer did not stop in time"),
            }
        }
        if let Some(handle) = self.sweeper.take() {
            if join_timeout(handle, timeout).is_none() {
                warn!("retention sweeper did not stop in time");
            }
        }
        self.status()
    }
}

impl Drop for TelemetryHandle {
    fn drop(&mut self) {
        self.stop.trigger();
    }
}
