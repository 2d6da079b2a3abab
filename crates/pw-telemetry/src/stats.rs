//! Lock-free pipeline statistics.
//!
//! Counters are monotonically non-decreasing and updated with relaxed
//! atomics; gauges (`queue_depth`, `buffered`) move both ways. Any thread may
//! take a [`StatsSnapshot`] at any time.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub struct Statistics {
    entries_written: AtomicU64,
    entries_dropped: AtomicU64,
    files_rotated: AtomicU64,
    files_compressed: AtomicU64,
    files_pruned: AtomicU64,
    write_errors: AtomicU64,
    batches_flushed: AtomicU64,
    queue_depth: AtomicUsize,
    buffered: AtomicUsize,
}

/// Point-in-time copy of [`Statistics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub entries_written: u64,
    pub entries_dropped: u64,
    pub files_rotated: u64,
    pub files_compressed: u64,
    pub files_pruned: u64,
    pub write_errors: u64,
    pub batches_flushed: u64,
    pub queue_depth: usize,
    pub buffered: usize,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_written(&self, count: u64) {
        self.entries_written.fetch_add(count, Ordering::Relaxed);
        self.batches_flushed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.entries_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rotated(&self) {
        self.files_rotated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_compressed(&self) {
        self.files_compressed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pruned(&self) {
        self.files_pruned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_error(&self) {
        self.write_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn queue_incr(&self) {
        self.queue_depth.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn queue_decr(&self) {
        // Saturate: a receive can race ahead of the sender's increment.
        let _ = self
            .queue_depth
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |d| {
                Some(d.saturating_sub(1))
            });
    }

    pub(crate) fn set_buffered(&self, len: usize) {
        self.buffered.store(len, Ordering::Relaxed);
    }

    pub fn entries_written(&self) -> u64 {
        self.entries_written.load(Ordering::Relaxed)
    }

    pub fn entries_dropped(&self) -> u64 {
        self.entries_dropped.load(Ordering::Relaxed)
    }

    pub fn write_errors(&self) -> u64 {
        self.write_errors.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            entries_written: self.entries_written.load(Ordering::Relaxed),
            entries_dropped: self.entries_dropped.load(Ordering::Relaxed),
            files_rotated: self.files_rotated.load(Ordering::Relaxed),
            files_compressed: self.files_compressed.load(Ordering::Relaxed),
            files_pruned: self.files_pruned.load(Ordering::Relaxed),
            write_errors: self.write_errors.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            buffered: self.buffered.load(Ordering::Relaxed),
        }
    }
}
