//! File naming for the telemetry directory.
//!
//! ```text
//! <dir>/<prefix>_2026-03-01.json        active file for the day
//! <dir>/<prefix>_2026-03-01.1.json      rotated, awaiting compression
//! <dir>/<prefix>_2026-03-01.1.json.gz   rotated and compressed
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// Kind of a managed telemetry file, parsed from its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFileKind {
    Active { date: NaiveDate },
    Rotated { date: NaiveDate, seq: u32 },
    Compressed { date: NaiveDate, seq: u32 },
}

impl LogFileKind {
    pub fn date(&self) -> NaiveDate {
        match *self {
            LogFileKind::Active { date }
            | LogFileKind::Rotated { date, .. }
            | LogFileKind::Compressed { date, .. } => date,
        }
    }
}

/// Directory plus file-name prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLayout {
    dir: PathBuf,
    prefix: String,
}

impl LogLayout {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        LogLayout {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn stem(&self, date: NaiveDate) -> String {
        format!("{}_{}", self.prefix, date.format(DATE_FORMAT))
    }

    pub fn active_path(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("{}.json", self.stem(date)))
    }

    pub fn rotated_path(&self, date: NaiveDate, seq: u32) -> PathBuf {
        self.dir.join(format!("{}.{}.json", self.stem(date), seq))
    }

    pub fn compressed_path(&self, date: NaiveDate, seq: u32) -> PathBuf {
        self.dir.join(format!("{}.{}.json.gz", self.stem(date), seq))
    }

    /// Lowest sequence number with neither a rotated nor a compressed file.
    pub fn next_sequence(&self, date: NaiveDate) -> u32 {
        let mut seq = 1;
        while self.rotated_path(date, seq).exists() || self.compressed_path(date, seq).exists() {
            seq += 1;
        }
        seq
    }

    /// Parse a file name produced by this layout.
    pub fn classify(&self, file_name: &str) -> Option<LogFileKind> {
        let rest = file_name
            .strip_prefix(self.prefix.as_str())?
            .strip_prefix('_')?;
        let date_part = rest.get(..10)?;
        let date = NaiveDate::parse_from_str(date_part, DATE_FORMAT).ok()?;
        let tail = &rest[10..];

        if tail == ".json" {
            return Some(LogFileKind::Active { date });
        }
        let tail = tail.strip_prefix('.')?;
        if let Some(seq) = tail.strip_suffix(".json.gz") {
            return seq.parse().ok().map(|seq| LogFileKind::Compressed { date, seq });
        }
        if let Some(seq) = tail.strip_suffix(".json") {
            return seq.parse().ok().map(|seq| LogFileKind::Rotated { date, seq });
        }
        None
    }

    /// Retention match: any name this layout produces, plus the `.tmp`
    /// artifact of an interrupted compression.
    pub fn is_managed(&self, file_name: &str) -> bool {
        let name = file_name.strip_suffix(".tmp").unwrap_or(file_name);
        self.classify(name).is_some()
    }

    /// List every managed file in the directory.
    pub fn list(&self) -> io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if self.is_managed(name) {
                    files.push(entry.path());
                }
            }
        }
        files.sort();
        Ok(files)
    }

    /// Active files for days before `today`.
    pub fn stale_active_files(&self, today: NaiveDate) -> io::Result<Vec<(PathBuf, NaiveDate)>> {
        let mut stale = Vec::new();
        for path in self.list()? {
            let kind = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| self.classify(n));
            if let Some(LogFileKind::Active { date }) = kind {
                if date < today {
                    stale.push((path, date));
                }
            }
        }
        Ok(stale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    #[test]
    fn names_follow_pattern() {
        let layout = LogLayout::new("/logs", "pos_monitor");
        assert_eq!(
            layout.active_path(day(1)),
            PathBuf::from("/logs/pos_monitor_2026-03-01.json")
        );
        assert_eq!(
            layout.rotated_path(day(1), 3),
            PathBuf::from("/logs/pos_monitor_2026-03-01.3.json")
        );
        assert_eq!(
            layout.compressed_path(day(1), 3),
            PathBuf::from("/logs/pos_monitor_2026-03-01.3.json.gz")
        );
    }

    #[test]
    fn classify_parses_all_kinds() {
        let layout = LogLayout::new("/logs", "pos_monitor");
        assert_eq!(
            layout.classify("pos_monitor_2026-03-01.json"),
            Some(LogFileKind::Active { date: day(1) })
        );
        assert_eq!(
            layout.classify("pos_monitor_2026-03-01.12.json"),
            Some(LogFileKind::Rotated { date: day(1), seq: 12 })
        );
        assert_eq!(
            layout.classify("pos_monitor_2026-03-01.2.json.gz"),
            Some(LogFileKind::Compressed { date: day(1), seq: 2 })
        );
        assert_eq!(layout.classify("pos_monitor_2026-03-01.x.json"), None);
        assert_eq!(layout.classify("other_2026-03-01.json"), None);
        assert_eq!(layout.classify("pos_monitor_bad.json"), None);
        assert_eq!(layout.classify("service.log"), None);
    }

    #[test]
    fn prefix_with_underscore() {
        let layout = LogLayout::new("/logs", "pos_monitor");
        assert!(layout.is_managed("pos_monitor_2026-03-01.1.json.gz.tmp"));
        assert!(!layout.is_managed("pos_monitorx_2026-03-01.json"));
        assert!(!layout.is_managed("pos_monitor_notes.txt"));
    }

    #[test]
    fn shorter_prefix_does_not_claim_other_files() {
        let layout = LogLayout::new("/logs", "pos");
        assert!(layout.is_managed("pos_2026-03-01.json"));
        assert!(layout.is_managed("pos_2026-03-01.2.json.gz"));
        assert!(!layout.is_managed("pos_monitor_2026-01-01.json"));
        assert!(!layout.is_managed("pos_monitor_2026-01-01.1.json.gz"));
        assert!(!layout.is_managed("pos_2026-03-01.json.bak"));
    }

    #[test]
    fn next_sequence_skips_compressed() {
        let dir = tempdir().unwrap();
        let layout = LogLayout::new(dir.path(), "pm");
        assert_eq!(layout.next_sequence(day(1)), 1);

        fs::write(layout.compressed_path(day(1), 1), b"").unwrap();
        fs::write(layout.rotated_path(day(1), 2), b"").unwrap();
        assert_eq!(layout.next_sequence(day(1)), 3);
        assert_eq!(layout.next_sequence(day(2)), 1);
    }

    #[test]
    fn stale_active_files_are_found() {
        let dir = tempdir().unwrap();
        let layout = LogLayout::new(dir.path(), "pm");
        fs::write(layout.active_path(day(1)), b"{}\n").unwrap();
        fs::write(layout.active_path(day(2)), b"{}\n").unwrap();
        fs::write(layout.rotated_path(day(1), 1), b"").unwrap();

        let stale = layout.stale_active_files(day(2)).unwrap();
        assert_eq!(stale, vec![(layout.active_path(day(1)), day(1))]);
    }
}
