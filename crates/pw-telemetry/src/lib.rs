//! procwatch telemetry pipeline.
//!
//! This crate provides:
//! - A bounded, non-blocking ingestion queue
//! - A batching NDJSON writer with fsync-before-acknowledge semantics
//! - Size and day based rotation with gzip compression
//! - Age based retention sweeping
//! - Lock-free pipeline statistics

pub mod layout;
pub mod pipeline;
pub mod queue;
pub mod retention;
pub mod rotate;
pub mod stats;
pub mod writer;

pub use layout::{LogFileKind, LogLayout};
pub use pipeline::{Telemetry, TelemetryHandle, TelemetryStatus};
pub use queue::{bounded, Dequeue, EnqueueError, EventReceiver, EventSender};
pub use retention::{RetentionError, RetentionEvent, RetentionSweeper, SweepReport};
pub use rotate::{RotateError, RotationOutcome, Rotator};
pub use stats::{Statistics, StatsSnapshot};
pub use writer::{BatchWriter, WriteError, WriterConfig};

/// Default number of buffered entries per flush.
pub const DEFAULT_BATCH_SIZE: usize = 50;

/// Default flush interval in seconds.
pub const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 5;

/// Default ingestion queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Gzip level for rotated files.
pub const COMPRESSION_LEVEL: u32 = 6;
