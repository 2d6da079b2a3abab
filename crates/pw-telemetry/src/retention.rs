//! Age based retention for telemetry files.
//!
//! Every sweep deletes managed files (`<prefix>_*.json*`) whose modification
//! time is older than the retention horizon. Each deletion is reported as a
//! [`RetentionEvent`]; a file that cannot be deleted is logged and skipped
//! without aborting the sweep. Today's active file is never touched.
//!
//! ```no_run
//! use pw_telemetry::{LogLayout, RetentionSweeper};
//! use std::time::Duration;
//!
//! let sweeper = RetentionSweeper::new(
//!     LogLayout::new("/var/log/procwatch", "pos_monitor"),
//!     Duration::from_secs(30 * 86_400),
//! );
//! let preview = sweeper.preview()?;
//! println!("would prune {} files", preview.len());
//! let report = sweeper.sweep()?;
//! println!("pruned {} files, {} bytes", report.deleted(), report.bytes_freed());
//! # Ok::<(), pw_telemetry::RetentionError>(())
//! ```

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Local, Utc};
use pw_common::Shutdown;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::layout::LogLayout;
use crate::stats::Statistics;

/// Errors from retention operations.
#[derive(Error, Debug)]
pub enum RetentionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Reason for pruning a file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RetentionReason {
    /// File is older than the retention horizon.
    TtlExpired { retention_days: u64, age_days: u64 },
}

/// A candidate file for pruning.
#[derive(Debug, Clone)]
pub struct PruneCandidate {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified: SystemTime,
}

impl PruneCandidate {
    /// Age of the file relative to `now`.
    pub fn age_at(&self, now: SystemTime) -> Duration {
        now.duration_since(self.modified).unwrap_or_default()
    }

    pub fn age_days_at(&self, now: SystemTime) -> u64 {
        self.age_at(now).as_secs() / 86_400
    }
}

/// Record of a single pruning action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionEvent {
    pub timestamp: DateTime<Utc>,
    pub file_path: String,
    pub size_bytes: u64,
    pub age_days: u64,
    pub reason: RetentionReason,
    pub dry_run: bool,
    /// False when the deletion failed.
    pub deleted: bool,
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub events: Vec<RetentionEvent>,
    pub failures: usize,
}

impl SweepReport {
    pub fn deleted(&self) -> usize {
        self.events.iter().filter(|e| e.deleted).count()
    }

    pub fn bytes_freed(&self) -> u64 {
        self.events
            .iter()
            .filter(|e| e.deleted)
            .map(|e| e.size_bytes)
            .sum()
    }
}

/// Deletes telemetry files older than the retention horizon.
#[derive(Debug, Clone)]
pub struct RetentionSweeper {
    layout: LogLayout,
    retention: Duration,
    stats: Option<Arc<Statistics>>,
}

impl RetentionSweeper {
    pub fn new(layout: LogLayout, retention: Duration) -> Self {
        RetentionSweeper {
            layout,
            retention,
            stats: None,
        }
    }

    /// Count deletions in the shared pipeline statistics.
    pub fn with_stats(mut self, stats: Arc<Statistics>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    fn retention_days(&self) -> u64 {
        self.retention.as_secs() / 86_400
    }

    /// Files that a sweep at `now` would delete.
    pub fn preview_at(&self, now: SystemTime) -> Result<Vec<PruneCandidate>, RetentionError> {
        if self.retention.is_zero() {
            return Err(RetentionError::InvalidConfig(
                "retention must be greater than zero".into(),
            ));
        }
        let Some(cutoff) = now.checked_sub(self.retention) else {
            return Ok(Vec::new());
        };
        let today = DateTime::<Local>::from(now).date_naive();
        let protected = self.layout.active_path(today);

        let files = match self.layout.list() {
            Ok(files) => files,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut candidates = Vec::new();
        for path in files {
            if path == protected {
                continue;
            }
            let meta = match fs::metadata(&path) {
                Ok(meta) => meta,
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "cannot stat file during sweep");
                    continue;
                }
            };
            let modified = match meta.modified() {
                Ok(m) => m,
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "no modification time");
                    continue;
                }
            };
            if modified < cutoff {
                candidates.push(PruneCandidate {
                    path,
                    size_bytes: meta.len(),
                    modified,
                });
            }
        }
        Ok(candidates)
    }

    pub fn preview(&self) -> Result<Vec<PruneCandidate>, RetentionError> {
        self.preview_at(SystemTime::now())
    }

    /// Delete expired files.
    pub fn sweep(&self) -> Result<SweepReport, RetentionError> {
        self.sweep_at(SystemTime::now(), false)
    }

    /// Report what a sweep would delete without deleting anything.
    pub fn dry_run(&self) -> Result<SweepReport, RetentionError> {
        self.sweep_at(SystemTime::now(), true)
    }

    pub fn sweep_at(&self, now: SystemTime, dry_run: bool) -> Result<SweepReport, RetentionError> {
        let candidates = self.preview_at(now)?;
        let mut report = SweepReport {
            scanned: candidates.len(),
            ..SweepReport::default()
        };
        let timestamp = Utc::now();

        for candidate in candidates {
            let age_days = candidate.age_days_at(now);
            let mut event = RetentionEvent {
                timestamp,
                file_path: candidate.path.display().to_string(),
                size_bytes: candidate.size_bytes,
                age_days,
                reason: RetentionReason::TtlExpired {
                    retention_days: self.retention_days(),
                    age_days,
                },
                dry_run,
                deleted: false,
            };

            if dry_run {
                info!(file = %event.file_path, age_days, "[DRY-RUN] would prune");
            } else {
                match fs::remove_file(&candidate.path) {
                    Ok(()) => {
                        event.deleted = true;
                        if let Some(stats) = &self.stats {
                            stats.record_pruned();
                        }
                        info!(file = %event.file_path, age_days, bytes = event.size_bytes, "pruned expired file");
                    }
                    Err(e) => {
                        report.failures += 1;
                        warn!(file = %event.file_path, error = %e, "failed to delete expired file");
                    }
                }
            }
            report.events.push(event);
        }
        Ok(report)
    }

    /// Sweep now and then every `interval` until `stop` is triggered.
    pub fn run(&self, stop: &Shutdown, interval: Duration) {
        info!(dir = %self.layout.dir().display(), days = self.retention_days(), "retention sweeper started");
        loop {
            match self.sweep() {
                Ok(report) if report.deleted() > 0 || report.failures > 0 => {
                    info!(deleted = report.deleted(), failures = report.failures, bytes = report.bytes_freed(), "retention sweep complete");
                }
                Ok(_) => debug!("retention sweep found nothing to prune"),
                Err(e) => warn!(error = %e, "retention sweep failed"),
            }
            if stop.wait_timeout(interval) {
                break;
            }
        }
        debug!("retention sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    const DAY: u64 = 86_400;

    fn create_aged(path: &std::path::Path, age: Duration) {
        fs::write(path, b"{}\n").unwrap();
        let mtime = filetime::FileTime::from_system_time(SystemTime::now() - age);
        filetime::set_file_times(path, mtime, mtime).unwrap();
    }

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, d).unwrap()
    }

    #[test]
    fn expired_files_are_deleted() {
        let dir = tempdir().unwrap();
        let layout = LogLayout::new(dir.path(), "pm");
        let stats = Arc::new(Statistics::new());
        let sweeper = RetentionSweeper::new(layout.clone(), Duration::from_secs(30 * DAY))
            .with_stats(Arc::clone(&stats));

        let old = layout.compressed_path(date(1), 1);
        let young = layout.compressed_path(date(2), 1);
        create_aged(&old, Duration::from_secs(45 * DAY));
        create_aged(&young, Duration::from_secs(5 * DAY));

        let report = sweeper.sweep().unwrap();
        assert_eq!(report.deleted(), 1);
        assert!(!old.exists());
        assert!(young.exists());
        assert_eq!(stats.snapshot().files_pruned, 1);
        match &report.events[0].reason {
            RetentionReason::TtlExpired { retention_days, age_days } => {
                assert_eq!(*retention_days, 30);
                assert!((44..=46).contains(age_days));
            }
        }
    }

    #[test]
    fn unmanaged_files_are_ignored() {
        let dir = tempdir().unwrap();
        let layout = LogLayout::new(dir.path(), "pm");
        let sweeper = RetentionSweeper::new(layout, Duration::from_secs(DAY));

        let foreign = dir.path().join("service.log");
        create_aged(&foreign, Duration::from_secs(90 * DAY));
        assert_eq!(sweeper.sweep().unwrap().deleted(), 0);
        assert!(foreign.exists());
    }

    #[test]
    fn dry_run_keeps_files() {
        let dir = tempdir().unwrap();
        let layout = LogLayout::new(dir.path(), "pm");
        let sweeper = RetentionSweeper::new(layout.clone(), Duration::from_secs(DAY));
        let old = layout.rotated_path(date(1), 1);
        create_aged(&old, Duration::from_secs(3 * DAY));

        let report = sweeper.dry_run().unwrap();
        assert_eq!(report.events.len(), 1);
        assert!(report.events[0].dry_run);
        assert_eq!(report.deleted(), 0);
        assert!(old.exists());
    }

    #[test]
    fn missing_directory_is_empty() {
        let dir = tempdir().unwrap();
        let layout = LogLayout::new(dir.path().join("absent"), "pm");
        let sweeper = RetentionSweeper::new(layout, Duration::from_secs(DAY));
        assert!(sweeper.preview().unwrap().is_empty());
    }

    #[test]
    fn todays_active_file_is_protected() {
        let dir = tempdir().unwrap();
        let layout = LogLayout::new(dir.path(), "pm");
        let sweeper = RetentionSweeper::new(layout.clone(), Duration::from_secs(DAY));
        let active = layout.active_path(Local::now().date_naive());
        create_aged(&active, Duration::from_secs(10 * DAY));

        assert!(sweeper.preview().unwrap().is_empty());
        assert!(active.exists());
    }

    #[test]
    fn zero_retention_is_rejected() {
        let dir = tempdir().unwrap();
        let sweeper = RetentionSweeper::new(LogLayout::new(dir.path(), "pm"), Duration::ZERO);
        assert!(matches!(
            sweeper.preview(),
            Err(RetentionError::InvalidConfig(_))
        ));
    }
}
