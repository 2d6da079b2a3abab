//! End-to-end pipeline tests against a real temporary directory.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, SystemTime};

use flate2::read::GzDecoder;
use pw_common::{Event, EventType};
use pw_telemetry::{
    bounded, LogFileKind, LogLayout, RetentionSweeper, Statistics, Telemetry, WriterConfig,
};
use tempfile::tempdir;

const DAY: u64 = 86_400;

fn pipeline(dir: &Path, batch_size: usize, capacity: usize) -> Telemetry {
    Telemetry {
        writer: WriterConfig::new(dir)
            .with_prefix("pm")
            .with_batch_size(batch_size)
            .with_flush_interval(Duration::from_secs(60))
            .with_poll_timeout(Duration::from_millis(20)),
        queue_capacity: capacity,
        retention: Duration::from_secs(30 * DAY),
        sweep_interval: Duration::from_secs(3600),
    }
}

fn perf_event(n: usize) -> Event {
    Event::new(EventType::Performance, "pos.exe")
        .with_pid(4242)
        .with("seq", n)
        .with("metrics", serde_json::json!({"cpu_percent": n as f64 / 7.0, "thread_count": 12}))
}

fn managed_files(dir: &Path) -> Vec<(PathBuf, LogFileKind)> {
    let layout = LogLayout::new(dir, "pm");
    layout
        .list()
        .unwrap()
        .into_iter()
        .filter_map(|p| {
            let kind = layout.classify(p.file_name()?.to_str()?)?;
            Some((p, kind))
        })
        .collect()
}

fn read_all(path: &Path) -> String {
    let mut out = String::new();
    if path.extension().and_then(|e| e.to_str()) == Some("gz") {
        GzDecoder::new(File::open(path).unwrap())
            .read_to_string(&mut out)
            .unwrap();
    } else {
        File::open(path).unwrap().read_to_string(&mut out).unwrap();
    }
    out
}

#[test]
fn every_entry_is_written_or_counted_as_dropped() {
    let dir = tempdir().unwrap();
    let handle = pipeline(dir.path(), 50, 1000).start().unwrap();
    let sender = handle.sender();

    let n = 230;
    for i in 0..n {
        sender.emit(perf_event(i));
    }
    let status = handle.shutdown(Duration::from_secs(10));

    assert_eq!(status.stats.entries_written + status.stats.entries_dropped, n as u64);
    assert_eq!(status.stats.entries_dropped, 0);
    assert!(status.stats.batches_flushed >= (n / 50) as u64);
    assert_eq!(status.buffer_len, 0);
    assert_eq!(status.queue_depth, 0);
    assert!(!status.writer_running);
}

#[test]
fn written_records_round_trip_in_order() {
    let dir = tempdir().unwrap();
    let handle = pipeline(dir.path(), 8, 100).start().unwrap();
    let sender = handle.sender();

    let sent: Vec<Event> = (0..37).map(perf_event).collect();
    for event in &sent {
        sender.enqueue(event.clone()).unwrap();
    }
    handle.shutdown(Duration::from_secs(10));

    let files = managed_files(dir.path());
    assert_eq!(files.len(), 1, "expected a single active file: {:?}", files);
    let parsed: Vec<Event> = read_all(&files[0].0)
        .lines()
        .map(|l| Event::from_line(l).unwrap())
        .collect();
    assert_eq!(parsed, sent);
}

#[test]
fn large_stream_rotates_at_one_mebibyte() {
    let dir = tempdir().unwrap();
    let mut telemetry = pipeline(dir.path(), 50, 5000);
    telemetry.writer = telemetry.writer.with_max_file_size(1024 * 1024);
    let handle = telemetry.start().unwrap();
    let sender = handle.sender();

    let filler = "x".repeat(1024);
    for i in 0..1500 {
        sender.emit(perf_event(i).with("note", &filler));
    }
    let status = handle.shutdown(Duration::from_secs(20));
    assert_eq!(status.stats.entries_written, 1500);
    assert!(status.stats.files_rotated >= 1);

    let files = managed_files(dir.path());
    let compressed: Vec<_> = files
        .iter()
        .filter(|(_, k)| matches!(k, LogFileKind::Compressed { .. }))
        .collect();
    assert!(!compressed.is_empty());

    for (path, kind) in &files {
        if matches!(kind, LogFileKind::Active { .. }) {
            assert!(fs::metadata(path).unwrap().len() < 1024 * 1024);
        }
    }

    // Nothing lost across rotated and active files.
    let total: usize = files.iter().map(|(p, _)| read_all(p).lines().count()).sum();
    assert_eq!(total, 1500);
}

#[test]
fn retention_boundary_is_respected() {
    let dir = tempdir().unwrap();
    let layout = LogLayout::new(dir.path(), "pm");
    let retention_days = 30;
    let sweeper = RetentionSweeper::new(layout.clone(), Duration::from_secs(retention_days * DAY));

    let date = chrono::NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
    let expired = layout.compressed_path(date, 1);
    let kept = layout.compressed_path(date, 2);
    let now = SystemTime::now();
    for (path, age_days) in [(&expired, retention_days + 1), (&kept, retention_days - 1)] {
        fs::write(path, b"data").unwrap();
        let mtime = filetime::FileTime::from_system_time(now - Duration::from_secs(age_days * DAY));
        filetime::set_file_times(path, mtime, mtime).unwrap();
    }

    let report = sweeper.sweep_at(now, false).unwrap();
    assert_eq!(report.deleted(), 1);
    assert!(!expired.exists());
    assert!(kept.exists());
}

#[test]
fn concurrent_producers_against_stalled_consumer() {
    let stats = Arc::new(Statistics::new());
    let (sender, _receiver) = bounded(100, Arc::clone(&stats));
    let threads = 10;
    let per_thread = 100;
    let barrier = Arc::new(Barrier::new(threads));

    let workers: Vec<_> = (0..threads)
        .map(|t| {
            let sender = sender.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                (0..per_thread)
                    .filter(|i| sender.enqueue(perf_event(t * per_thread + i)).is_ok())
                    .count()
            })
        })
        .collect();

    let accepted: usize = workers.into_iter().map(|w| w.join().unwrap()).sum();
    assert_eq!(accepted, 100);
    assert_eq!(stats.entries_dropped(), 900);
    assert_eq!(stats.snapshot().queue_depth, 100);
}

#[test]
fn overload_is_accounted() {
    let dir = tempdir().unwrap();
    let stats = Arc::new(Statistics::new());
    let (sender, receiver) = bounded(10, Arc::clone(&stats));
    for i in 0..25 {
        sender.emit(perf_event(i));
    }
    drop(sender);

    let writer = pw_telemetry::BatchWriter::new(
        WriterConfig::new(dir.path()).with_prefix("pm").with_batch_size(4),
        Arc::clone(&stats),
    )
    .unwrap();
    writer.run(&receiver, &pw_common::Shutdown::new()).unwrap();

    let snap = stats.snapshot();
    assert_eq!(snap.entries_written, 10);
    assert_eq!(snap.entries_dropped, 15);
    assert_eq!(snap.entries_written + snap.entries_dropped, 25);
}
