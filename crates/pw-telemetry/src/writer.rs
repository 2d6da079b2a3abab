//! Batched NDJSON writer for telemetry events.
//!
//! Provides buffered writes with count- and time-triggered flushing. A batch
//! is acknowledged (removed from the buffer and counted as written) only
//! after the bytes have been written and fsynced. A failed flush keeps the
//! batch for the next attempt, so delivery is at-least-once.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Local, NaiveDate};
use pw_common::{AgentConfig, Event, Shutdown};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::layout::LogLayout;
use crate::queue::{Dequeue, EventReceiver};
use crate::rotate::Rotator;
use crate::stats::Statistics;
use crate::{DEFAULT_BATCH_SIZE, DEFAULT_FLUSH_INTERVAL_SECS};

/// Errors from telemetry writer operations.
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Active file not open")]
    NotOpen,
}

/// Configuration for the batch writer.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Directory for telemetry files.
    pub dir: PathBuf,

    /// File name prefix.
    pub prefix: String,

    /// Maximum entries to buffer before flushing.
    pub batch_size: usize,

    /// Maximum age of the oldest buffered entry.
    pub flush_interval: Duration,

    /// Rotate once the active file reaches this many bytes.
    pub max_file_size: u64,

    /// How long a single dequeue waits.
    pub poll_timeout: Duration,
}

impl WriterConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        WriterConfig {
            dir: dir.into(),
            prefix: "pos_monitor".to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: Duration::from_secs(DEFAULT_FLUSH_INTERVAL_SECS),
            max_file_size: 100 * 1024 * 1024,
            poll_timeout: Duration::from_secs(1),
        }
    }

    /// Build from the agent's `logging` section.
    pub fn from_agent(config: &AgentConfig) -> Self {
        WriterConfig::new(config.log_dir())
            .with_prefix(config.logging.file_prefix.clone())
            .with_batch_size(config.logging.batch_size)
            .with_flush_interval(config.flush_interval())
            .with_max_file_size(config.max_file_size_bytes())
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn layout(&self) -> LogLayout {
        LogLayout::new(self.dir.clone(), self.prefix.clone())
    }
}

#[derive(Debug)]
struct ActiveFile {
    path: PathBuf,
    file: File,
    size: u64,
    date: NaiveDate,
}

/// Single-consumer batch writer.
#[derive(Debug)]
pub struct BatchWriter {
    config: WriterConfig,
    layout: LogLayout,
    rotator: Rotator,
    stats: Arc<Statistics>,
    buffer: Vec<Event>,
    last_flush: Instant,
    active: Option<ActiveFile>,
    recovered: bool,
}

impl BatchWriter {
    /// Create a writer, creating the log directory if needed.
    pub fn new(config: WriterConfig, stats: Arc<Statistics>) -> Result<Self, WriteError> {
        if config.prefix.is_empty() {
            return Err(WriteError::InvalidPath("empty file prefix".into()));
        }
        fs::create_dir_all(&config.dir)?;
        let layout = config.layout();
        let rotator = Rotator::new(layout.clone(), Arc::clone(&stats));
        Ok(BatchWriter {
            config,
            layout,
            rotator,
            stats,
            buffer: Vec::new(),
            last_flush: Instant::now(),
            active: None,
            recovered: false,
        })
    }

    pub fn config(&self) -> &WriterConfig {
        &self.config
    }

    /// Number of entries waiting for the next flush.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Path of the currently open file, if any.
    pub fn active_path(&self) -> Option<&Path> {
        self.active.as_ref().map(|a| a.path.as_path())
    }

    /// Size in bytes of the currently open file.
    pub fn active_size(&self) -> u64 {
        self.active.as_ref().map(|a| a.size).unwrap_or(0)
    }

    /// Buffer an event, flushing if the batch is full.
    pub fn push(&mut self, event: Event) -> Result<usize, WriteError> {
        self.buffer.push(event);
        self.stats.set_buffered(self.buffer.len());
        if self.buffer.len() >= self.config.batch_size {
            return self.flush();
        }
        Ok(0)
    }

    /// Whether the flush interval has elapsed with entries pending.
    pub fn flush_due(&self) -> bool {
        !self.buffer.is_empty() && self.last_flush.elapsed() >= self.config.flush_interval
    }

    /// Flush into today's file.
    pub fn flush(&mut self) -> Result<usize, WriteError> {
        self.flush_on(Local::now().date_naive())
    }

    /// Flush into the file for `today`. Returns the number of entries written.
    pub fn flush_on(&mut self, today: NaiveDate) -> Result<usize, WriteError> {
        if self.buffer.is_empty() {
            self.last_flush = Instant::now();
            return Ok(0);
        }

        let payload = self.serialize_buffer();
        if self.buffer.is_empty() {
            self.stats.set_buffered(0);
            return Ok(0);
        }

        match self.append(&payload, today) {
            Ok(()) => {
                let written = self.buffer.len();
                self.stats.record_written(written as u64);
                self.buffer.clear();
                self.stats.set_buffered(0);
                self.last_flush = Instant::now();
                debug!(entries = written, bytes = payload.len(), "flushed batch");

                if self.active_size() >= self.config.max_file_size {
                    self.rotate_active();
                }
                Ok(written)
            }
            Err(e) => {
                self.stats.record_write_error();
                // Reopen on the next attempt.
                self.active = None;
                warn!(error = %e, pending = self.buffer.len(), "flush failed, batch retained");
                Err(e)
            }
        }
    }

    /// Serialize the buffer into NDJSON, discarding entries that cannot be
    /// serialized.
    fn serialize_buffer(&mut self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(self.buffer.len() * 256);
        let stats = &self.stats;
        self.buffer.retain(|event| match serde_json::to_vec(event) {
            Ok(line) => {
                payload.extend_from_slice(&line);
                payload.push(b'\n');
                true
            }
            Err(e) => {
                stats.record_write_error();
                error!(event_type = %event.event_type, error = %e, "discarding unserializable event");
                false
            }
        });
        payload
    }

    fn append(&mut self, bytes: &[u8], today: NaiveDate) -> Result<(), WriteError> {
        self.ensure_active(today)?;
        let active = self.active.as_mut().ok_or(WriteError::NotOpen)?;
        let start = active.size;
        if let Err(e) = write_synced(&mut active.file, bytes) {
            // The batch is retried; drop whatever part of it reached the file.
            if let Err(trim) = active.file.set_len(start) {
                warn!(file = %active.path.display(), error = %trim, "failed to discard partial batch");
            }
            return Err(e.into());
        }
        active.size += bytes.len() as u64;
        Ok(())
    }

    /// Make sure the active file belongs to `today`, finalizing an older one.
    fn ensure_active(&mut self, today: NaiveDate) -> Result<(), WriteError> {
        match self.active.take() {
            Some(active) if active.date == today => {
                self.active = Some(active);
                return Ok(());
            }
            Some(previous) => {
                info!(file = %previous.path.display(), "day changed, finalizing file");
                drop(previous);
            }
            None => {}
        }

        fs::create_dir_all(&self.config.dir)?;
        self.finalize_stale(today);

        let path = self.layout.active_path(today);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        let found = file.metadata()?.len();
        let size = trim_partial_line(&mut file, found)?;
        if size < found {
            warn!(file = %path.display(), discarded = found - size, "discarded unterminated final line");
        }
        debug!(file = %path.display(), size, "opened active file");
        self.active = Some(ActiveFile {
            path,
            file,
            size,
            date: today,
        });
        Ok(())
    }

    /// Rotate active files from earlier days, and on the first open also
    /// compress rotated files a previous run left behind.
    fn finalize_stale(&mut self, today: NaiveDate) {
        match self.layout.stale_active_files(today) {
            Ok(stale) => {
                for (path, date) in stale {
                    if let Err(e) = self.rotator.rotate(&path, date) {
                        warn!(file = %path.display(), error = %e, "failed to finalize stale file");
                    }
                }
            }
            Err(e) => warn!(error = %e, "failed to scan for stale files"),
        }
        if !self.recovered {
            self.recovered = true;
            match self.rotator.compress_pending() {
                Ok(0) => {}
                Ok(n) => info!(files = n, "compressed leftover rotated files"),
                Err(e) => warn!(error = %e, "failed to scan for uncompressed files"),
            }
        }
    }

    /// Close and rotate the active file. On failure the file stays in place
    /// and is reopened for append by the next flush.
    fn rotate_active(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        let ActiveFile { path, file, date, size } = active;
        drop(file);
        match self.rotator.rotate(&path, date) {
            Ok(outcome) => {
                info!(size, seq = outcome.seq, compressed = outcome.compressed.is_some(), "size rotation complete")
            }
            Err(e) => warn!(file = %path.display(), error = %e, "rotation failed, continuing with current file"),
        }
    }

    fn flush_logged(&mut self) {
        if let Err(e) = self.flush() {
            debug!(error = %e, "flush will be retried");
        }
    }

    /// Consume events until `stop` is triggered or every sender is gone,
    /// then drain the queue and perform a final forced flush.
    pub fn run(mut self, rx: &EventReceiver, stop: &Shutdown) -> Result<usize, WriteError> {
        let poll = self.config.poll_timeout;
        info!(dir = %self.config.dir.display(), batch_size = self.config.batch_size, "batch writer started");

        loop {
            if stop.is_triggered() {
                break;
            }

            // A failed batch is still pending: stop taking new entries so
            // memory stays bounded, and retry after a pause.
            if self.buffer.len() >= self.config.batch_size {
                if stop.wait_timeout(poll) {
                    break;
                }
                self.flush_logged();
                continue;
            }

            match rx.dequeue(poll) {
                Dequeue::Event(event) => {
                    self.buffer.push(event);
                    self.stats.set_buffered(self.buffer.len());
                    if self.buffer.len() >= self.config.batch_size {
                        self.flush_logged();
                    }
                }
                Dequeue::Empty => {}
                Dequeue::Closed => break,
            }

            if self.flush_due() {
                self.flush_logged();
            }
        }

        while let Dequeue::Event(event) = rx.try_dequeue() {
            self.buffer.push(event);
        }
        self.stats.set_buffered(self.buffer.len());
        self.close()
    }

    /// Final forced flush.
    pub fn close(mut self) -> Result<usize, WriteError> {
        let pending = self.buffer.len();
        let result = self.flush();
        match &result {
            Ok(n) => info!(entries = n, "batch writer closed"),
            Err(e) => error!(error = %e, lost = pending, "final flush failed"),
        }
        // Nothing left for Drop to retry.
        self.buffer.clear();
        result
    }
}

fn write_synced(file: &mut File, bytes: &[u8]) -> io::Result<()> {
    file.write_all(bytes)?;
    file.flush()?;
    file.sync_all()
}

/// Truncate `file` (currently `len` bytes) to just after its last newline,
/// removing a record whose write was interrupted. Returns the new length.
fn trim_partial_line(file: &mut File, len: u64) -> io::Result<u64> {
    const CHUNK: u64 = 64 * 1024;
    let mut buf = vec![0u8; CHUNK as usize];
    let mut end = len;
    while end > 0 {
        let begin = end.saturating_sub(CHUNK);
        let chunk = &mut buf[..(end - begin) as usize];
        file.seek(SeekFrom::Start(begin))?;
        file.read_exact(chunk)?;
        if let Some(pos) = chunk.iter().rposition(|&b| b == b'\n') {
            let keep = begin + pos as u64 + 1;
            if keep < len {
                file.set_len(keep)?;
            }
            return Ok(keep);
        }
        end = begin;
    }
    if len > 0 {
        file.set_len(0)?;
    }
    Ok(0)
}

impl Drop for BatchWriter {
    fn drop(&mut self) {
        // Best-effort flush on drop
        if !self.buffer.is_empty() {
            let _ = self.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pw_common::EventType;
    use tempfile::tempdir;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    fn event(n: u32) -> Event {
        Event::new(EventType::Performance, "pos.exe")
            .with_pid(n)
            .with("seq", n)
    }

    fn read_lines(path: &Path) -> Vec<Event> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| Event::from_line(l).unwrap())
            .collect()
    }

    #[test]
    fn flushes_when_batch_is_full() {
        let dir = tempdir().unwrap();
        let stats = Arc::new(Statistics::new());
        let config = WriterConfig::new(dir.path()).with_batch_size(3);
        let mut writer = BatchWriter::new(config, Arc::clone(&stats)).unwrap();

        assert_eq!(writer.push(event(1)).unwrap(), 0);
        assert_eq!(writer.push(event(2)).unwrap(), 0);
        assert_eq!(writer.push(event(3)).unwrap(), 3);
        assert_eq!(writer.buffered(), 0);
        assert_eq!(stats.entries_written(), 3);

        let path = writer.active_path().unwrap().to_path_buf();
        let lines = read_lines(&path);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[2].pid, Some(3));
    }

    #[test]
    fn flush_due_respects_interval() {
        let dir = tempdir().unwrap();
        let config = WriterConfig::new(dir.path())
            .with_batch_size(100)
            .with_flush_interval(Duration::from_millis(20));
        let mut writer = BatchWriter::new(config, Arc::new(Statistics::new())).unwrap();

        assert!(!writer.flush_due());
        writer.push(event(1)).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert!(writer.flush_due());
        assert_eq!(writer.flush().unwrap(), 1);
        assert!(!writer.flush_due());
    }

    #[test]
    fn empty_flush_is_a_noop() {
        let dir = tempdir().unwrap();
        let mut writer =
            BatchWriter::new(WriterConfig::new(dir.path()), Arc::new(Statistics::new())).unwrap();
        assert_eq!(writer.flush().unwrap(), 0);
        assert!(writer.active_path().is_none());
    }

    #[test]
    fn failed_flush_keeps_batch() {
        let dir = tempdir().unwrap();
        let log_dir = dir.path().join("logs");
        let stats = Arc::new(Statistics::new());
        let config = WriterConfig::new(&log_dir).with_batch_size(10);
        let mut writer = BatchWriter::new(config, Arc::clone(&stats)).unwrap();

        // Replace the directory with a plain file so opening fails.
        fs::remove_dir_all(&log_dir).unwrap();
        fs::write(&log_dir, b"not a directory").unwrap();

        writer.push(event(1)).unwrap();
        writer.push(event(2)).unwrap();
        assert!(writer.flush_on(day(1)).is_err());
        assert_eq!(writer.buffered(), 2);
        assert_eq!(stats.write_errors(), 1);
        assert_eq!(stats.entries_written(), 0);

        fs::remove_file(&log_dir).unwrap();
        assert_eq!(writer.flush_on(day(1)).unwrap(), 2);
        assert_eq!(writer.buffered(), 0);
        assert_eq!(stats.entries_written(), 2);
        let layout = LogLayout::new(&log_dir, "pos_monitor");
        assert_eq!(read_lines(&layout.active_path(day(1))).len(), 2);
    }

    #[test]
    fn unterminated_tail_is_trimmed_before_append() {
        let dir = tempdir().unwrap();
        let stats = Arc::new(Statistics::new());
        let layout = LogLayout::new(dir.path(), "pos_monitor");
        let path = layout.active_path(day(1));
        let mut existing = event(1).to_line().unwrap();
        existing.push('\n');
        existing.push_str(r#"{"timestamp":"2026-03-01T00:00:00Z","ty"#);
        fs::write(&path, &existing).unwrap();

        let mut writer = BatchWriter::new(WriterConfig::new(dir.path()), Arc::clone(&stats)).unwrap();
        writer.push(Event::new(EventType::Crash, "pos.exe").with_pid(7)).unwrap();
        assert_eq!(writer.flush_on(day(1)).unwrap(), 1);

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].pid, Some(1));
        assert_eq!(lines[1].event_type, EventType::Crash);
        assert_eq!(writer.active_size(), fs::metadata(&path).unwrap().len());
    }

    #[test]
    fn file_without_any_newline_is_reset() {
        let dir = tempdir().unwrap();
        let layout = LogLayout::new(dir.path(), "pos_monitor");
        let path = layout.active_path(day(1));
        fs::write(&path, r#"{"timestamp":"2026"#).unwrap();

        let mut writer =
            BatchWriter::new(WriterConfig::new(dir.path()), Arc::new(Statistics::new())).unwrap();
        writer.push(event(2)).unwrap();
        writer.flush_on(day(1)).unwrap();
        let lines = read_lines(&path);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].pid, Some(2));
    }

    #[test]
    fn day_change_finalizes_previous_file() {
        let dir = tempdir().unwrap();
        let stats = Arc::new(Statistics::new());
        let config = WriterConfig::new(dir.path()).with_prefix("pm");
        let mut writer = BatchWriter::new(config, Arc::clone(&stats)).unwrap();
        let layout = LogLayout::new(dir.path(), "pm");

        writer.push(event(1)).unwrap();
        writer.flush_on(day(1)).unwrap();
        writer.push(event(2)).unwrap();
        writer.flush_on(day(2)).unwrap();

        assert!(!layout.active_path(day(1)).exists());
        assert!(layout.compressed_path(day(1), 1).exists());
        assert_eq!(writer.active_path(), Some(layout.active_path(day(2)).as_path()));
        assert_eq!(read_lines(&layout.active_path(day(2)))[0].pid, Some(2));
        assert_eq!(stats.snapshot().files_rotated, 1);
    }

    #[test]
    fn size_threshold_triggers_rotation() {
        let dir = tempdir().unwrap();
        let config = WriterConfig::new(dir.path())
            .with_prefix("pm")
            .with_batch_size(100)
            .with_max_file_size(200);
        let mut writer = BatchWriter::new(config, Arc::new(Statistics::new())).unwrap();
        let layout = LogLayout::new(dir.path(), "pm");

        for n in 0..10 {
            writer.push(event(n)).unwrap();
            writer.flush_on(day(1)).unwrap();
        }
        assert!(layout.compressed_path(day(1), 1).exists());
        assert!(writer.active_size() < 200);
    }

    #[test]
    fn drop_flushes_pending_entries() {
        let dir = tempdir().unwrap();
        let stats = Arc::new(Statistics::new());
        {
            let config = WriterConfig::new(dir.path()).with_batch_size(100);
            let mut writer = BatchWriter::new(config, Arc::clone(&stats)).unwrap();
            writer.push(event(1)).unwrap();
        }
        assert_eq!(stats.entries_written(), 1);
    }
}
