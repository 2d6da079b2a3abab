//! External event sources.
//!
//! An [`EventSource`] is polled periodically by the supervisor and owns its
//! own cursor, so a record is reported once no matter how often it is
//! polled. [`LogFileSource`] tails plain-text application logs, the usual
//! place a JVM-based point-of-sale application reports its failures.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use pw_common::config::EventLogConfig;
use pw_common::{Event, EventType};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn, Span};

/// Most stack frames kept from one Java trace.
pub const MAX_STACK_FRAMES: usize = 10;

/// Upper bound on bytes read from one file per poll.
const MAX_READ_PER_POLL: u64 = 4 * 1024 * 1024;

/// Something the agent can poll for externally reported events.
pub trait EventSource: Send {
    fn name(&self) -> &str;

    /// Events that appeared since the previous poll.
    fn poll(&mut self) -> Vec<Event>;
}

// ---------------------------------------------------------------------------
// Severity
// ---------------------------------------------------------------------------

/// Record severity. Critical is kept apart from Error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Error,
    Warning,
    Information,
}

static LEVEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(fatal|critical|crit|severe|error|err|warning|warn|info|information|debug|trace|fine)\b")
        .expect("level pattern is valid")
});

impl Severity {
    /// Parse a configured level name.
    pub fn parse(level: &str) -> Option<Self> {
        match level.trim().to_ascii_lowercase().as_str() {
            "critical" | "crit" | "fatal" | "severe" => Some(Severity::Critical),
            "error" | "err" => Some(Severity::Error),
            "warning" | "warn" => Some(Severity::Warning),
            "information" | "info" => Some(Severity::Information),
            _ => None,
        }
    }

    /// Classify the first line of a record.
    pub fn detect(line: &str) -> Self {
        if let Some(m) = LEVEL_RE.find(line) {
            return Severity::parse(m.as_str()).unwrap_or(Severity::Information);
        }
        if JAVA_EXCEPTION_RE.is_match(line) {
            Severity::Error
        } else {
            Severity::Information
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Information => "information",
        }
    }
}

// ---------------------------------------------------------------------------
// Java details
// ---------------------------------------------------------------------------

static JAVA_EXCEPTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b((?:[A-Za-z_$][\w$]*\.)*[A-Za-z_$][\w$]*(?:Exception|Error))\b(?::[ \t]*([^\r\n]+))?")
        .expect("exception pattern is valid")
});

static MEMORY_AREA_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(Java heap space|Metaspace|Direct buffer memory|GC overhead limit exceeded|unable to create native thread)")
        .expect("memory area pattern is valid")
});

/// Exception details pulled out of a Java log record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JavaDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception_message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stack_trace: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_area: Option<String>,
}

impl JavaDetails {
    /// Extract details from `message`; `None` if nothing Java-like is found.
    pub fn parse(message: &str) -> Option<Self> {
        let mut details = JavaDetails::default();

        if let Some(caps) = JAVA_EXCEPTION_RE.captures(message) {
            details.exception_type = caps.get(1).map(|m| m.as_str().to_string());
            details.exception_message = caps
                .get(2)
                .map(|m| m.as_str().trim().to_string())
                .filter(|m| !m.is_empty());
        }

        details.stack_trace = message
            .lines()
            .map(str::trim)
            .filter(|line| line.starts_with("at "))
            .take(MAX_STACK_FRAMES)
            .map(str::to_string)
            .collect();

        if message.contains("OutOfMemoryError") {
            details.memory_area = MEMORY_AREA_RE
                .captures(message)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string());
        }

        (details != JavaDetails::default()).then_some(details)
    }
}

// ---------------------------------------------------------------------------
// Record assembly
// ---------------------------------------------------------------------------

/// A logical log record: a first line plus its continuation lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Byte offset of the first line in the file.
    pub offset: u64,
    pub text: String,
}

fn is_continuation(line: &str) -> bool {
    line.starts_with([' ', '\t'])
        || line.starts_with("Caused by")
        || line.starts_with("... ")
}

/// Split complete lines into records. `base` is the file offset of `text`.
pub fn group_records(text: &str, base: u64) -> Vec<LogRecord> {
    let mut records: Vec<LogRecord> = Vec::new();
    let mut offset = base;
    for raw in text.split_inclusive('\n') {
        let line = raw.trim_end_matches(['\r', '\n']);
        let start = offset;
        offset += raw.len() as u64;
        if line.trim().is_empty() {
            continue;
        }
        match records.last_mut() {
            Some(current) if is_continuation(line) => {
                current.text.push('\n');
                current.text.push_str(line);
            }
            _ => records.push(LogRecord {
                offset: start,
                text: line.to_string(),
            }),
        }
    }
    records
}

// ---------------------------------------------------------------------------
// LogFileSource
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
struct Cursor {
    offset: u64,
    /// Inside a line longer than one read; discard through its newline.
    skipping: bool,
}

/// Tails text log files and reports relevant error records.
pub struct LogFileSource {
    name: String,
    process_name: String,
    paths: Vec<PathBuf>,
    levels: Vec<Severity>,
    keywords: Vec<String>,
    read_existing: bool,
    cursors: HashMap<PathBuf, Cursor>,
    span: Span,
}

impl LogFileSource {
    pub fn new(process_name: &str, config: &EventLogConfig, span: Span) -> Self {
        let mut levels = Vec::new();
        for level in &config.levels {
            match Severity::parse(level) {
                Some(s) if !levels.contains(&s) => levels.push(s),
                Some(_) => {}
                None => warn!(level = %level, "ignoring unknown event log level"),
            }
        }
        LogFileSource {
            name: "logfile".to_string(),
            process_name: process_name.to_string(),
            paths: config.sources.clone(),
            levels,
            keywords: config.keywords.iter().map(|k| k.to_lowercase()).collect(),
            read_existing: config.read_existing,
            cursors: HashMap::new(),
            span,
        }
    }

    /// Whether a record mentions the target or a configured keyword.
    pub fn is_relevant(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        let name = self.process_name.to_lowercase();
        let stem = name.strip_suffix(".exe").unwrap_or(&name);
        (!stem.is_empty() && lower.contains(stem))
            || self.keywords.iter().any(|k| !k.is_empty() && lower.contains(k.as_str()))
    }

    /// Read complete new lines from `path`, advancing its cursor.
    fn read_new(&mut self, path: &Path) -> io::Result<Option<(String, u64)>> {
        let mut file = File::open(path)?;
        let len = file.metadata()?.len();

        let cursor = match self.cursors.get(path).copied() {
            Some(cursor) => cursor,
            None => {
                let start = if self.read_existing { 0 } else { len };
                debug!(path = %path.display(), offset = start, "tailing log file");
                let cursor = Cursor {
                    offset: start,
                    skipping: false,
                };
                self.cursors.insert(path.to_path_buf(), cursor);
                cursor
            }
        };

        let Cursor { mut offset, mut skipping } = cursor;
        if len < offset {
            info!(path = %path.display(), previous = offset, len, "log file truncated; reading from start");
            offset = 0;
            skipping = false;
        }
        if len == offset {
            self.cursors.insert(path.to_path_buf(), Cursor { offset, skipping });
            return Ok(None);
        }

        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::new();
        file.take((len - offset).min(MAX_READ_PER_POLL))
            .read_to_end(&mut buf)?;

        let mut start = 0;
        if skipping {
            match buf.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    start = pos + 1;
                    skipping = false;
                }
                None => {
                    self.cursors.insert(
                        path.to_path_buf(),
                        Cursor {
                            offset: offset + buf.len() as u64,
                            skipping: true,
                        },
                    );
                    return Ok(None);
                }
            }
        }

        // Leave a trailing partial line for the next poll.
        let complete = match buf[start..].iter().rposition(|&b| b == b'\n') {
            Some(pos) => start + pos + 1,
            None => start,
        };
        if complete == 0 && buf.len() as u64 == MAX_READ_PER_POLL {
            warn!(
                path = %path.display(),
                offset,
                limit = MAX_READ_PER_POLL,
                "line exceeds read limit; skipping it"
            );
            self.cursors.insert(
                path.to_path_buf(),
                Cursor {
                    offset: offset + buf.len() as u64,
                    skipping: true,
                },
            );
            return Ok(None);
        }

        self.cursors.insert(
            path.to_path_buf(),
            Cursor {
                offset: offset + complete as u64,
                skipping: false,
            },
        );
        if complete == start {
            return Ok(None);
        }
        let text = String::from_utf8_lossy(&buf[start..complete]).into_owned();
        Ok(Some((text, offset + start as u64)))
    }

    fn to_event(&self, path: &Path, record: &LogRecord, severity: Severity) -> Event {
        let mut event = Event::new(EventType::EventLog, &self.process_name)
            .with("source", path.display().to_string())
            .with("level", severity.as_str())
            .with("offset", record.offset)
            .with("message", &record.text);
        if let Some(details) = JavaDetails::parse(&record.text) {
            event.insert("java_details", details);
        }
        event
    }
}

impl EventSource for LogFileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn poll(&mut self) -> Vec<Event> {
        let span = self.span.clone();
        let _enter = span.enter();
        let mut events = Vec::new();

        for path in self.paths.clone() {
            let (text, base) = match self.read_new(&path) {
                Ok(Some(chunk)) => chunk,
                Ok(None) => continue,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(path = %path.display(), "log file not present");
                    continue;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to read log file");
                    continue;
                }
            };

            let before = events.len();
            for record in group_records(&text, base) {
                let first_line = record.text.lines().next().unwrap_or_default();
                let severity = Severity::detect(first_line);
                if !self.levels.contains(&severity) || !self.is_relevant(&record.text) {
                    continue;
                }
                events.push(self.to_event(&path, &record, severity));
            }
            if events.len() > before {
                info!(path = %path.display(), count = events.len() - before, "relevant log records found");
            }
        }
        events
    }
}

impl std::fmt::Debug for LogFileSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogFileSource")
            .field("paths", &self.paths)
            .field("levels", &self.levels)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::io::Write;
    use tempfile::tempdir;

    const OOM_TRACE: &str = "2024-01-15 10:00:00 ERROR [main] Unhandled failure in pos.exe\n\
java.lang.OutOfMemoryError: Java heap space\n\
\tat com.example.pos.Cart.add(Cart.java:42)\n\
\tat com.example.pos.Register.scan(Register.java:17)\n\
Caused by: java.lang.IllegalStateException: cart full\n\
\t... 3 more\n";

    fn config(path: &Path, read_existing: bool) -> EventLogConfig {
        EventLogConfig {
            enabled: true,
            sources: vec![path.to_path_buf()],
            read_existing,
            ..EventLogConfig::default()
        }
    }

    fn append(path: &Path, text: &str) {
        let mut f = OpenOptions::new().create(true).append(true).open(path).unwrap();
        f.write_all(text.as_bytes()).unwrap();
    }

    #[test]
    fn severity_detection() {
        assert_eq!(Severity::detect("10:00 FATAL boom"), Severity::Critical);
        assert_eq!(Severity::detect("10:00 SEVERE: boom"), Severity::Critical);
        assert_eq!(Severity::detect("[ERROR] boom"), Severity::Error);
        assert_eq!(Severity::detect("WARN low disk"), Severity::Warning);
        assert_eq!(Severity::detect("INFO started"), Severity::Information);
        assert_eq!(
            Severity::detect("Exception in thread \"main\" java.lang.NullPointerException"),
            Severity::Error
        );
        assert_eq!(Severity::detect("all quiet"), Severity::Information);
    }

    #[test]
    fn continuation_lines_join_the_record() {
        let records = group_records(OOM_TRACE, 100);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].offset, 100);
        assert!(records[1].text.starts_with("java.lang.OutOfMemoryError"));
        assert!(records[1].text.contains("Caused by"));
        assert!(records[1].text.ends_with("... 3 more"));
    }

    #[test]
    fn java_details_from_trace() {
        let details = JavaDetails::parse(
            "java.lang.OutOfMemoryError: Java heap space\n\tat a.B.c(B.java:1)\n\tat a.B.d(B.java:2)",
        )
        .unwrap();
        assert_eq!(details.exception_type.as_deref(), Some("java.lang.OutOfMemoryError"));
        assert_eq!(details.exception_message.as_deref(), Some("Java heap space"));
        assert_eq!(details.stack_trace.len(), 2);
        assert_eq!(details.stack_trace[0], "at a.B.c(B.java:1)");
        assert_eq!(details.memory_area.as_deref(), Some("Java heap space"));

        assert!(JavaDetails::parse("disk is fine").is_none());
    }

    #[test]
    fn stack_trace_is_capped() {
        let mut msg = String::from("java.lang.StackOverflowError\n");
        for i in 0..30 {
            msg.push_str(&format!("\tat a.B.f{i}(B.java:{i})\n"));
        }
        let details = JavaDetails::parse(&msg).unwrap();
        assert_eq!(details.stack_trace.len(), MAX_STACK_FRAMES);
        assert_eq!(details.exception_message, None);
    }

    #[test]
    fn tail_starts_at_end_and_deduplicates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "ERROR java crashed before the agent started\n");

        let mut source = LogFileSource::new("pos.exe", &config(&path, false), Span::none());
        assert!(source.poll().is_empty());

        append(&path, OOM_TRACE);
        let events = source.poll();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.event_type == EventType::EventLog));
        assert_eq!(events[0].get("level").unwrap(), "error");
        let java = events[1].get("java_details").unwrap();
        assert_eq!(java["exception_type"], "java.lang.OutOfMemoryError");
        assert_eq!(java["memory_area"], "Java heap space");

        assert!(source.poll().is_empty());
    }

    #[test]
    fn read_existing_and_filters() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(
            &path,
            "INFO pos.exe started\nERROR printer offline\nWARN jvm heap at 90%\nCRITICAL pos.exe lost database\n",
        );

        let mut source = LogFileSource::new("pos.exe", &config(&path, true), Span::none());
        let events = source.poll();
        let levels: Vec<_> = events
            .iter()
            .map(|e| e.get("level").unwrap().as_str().unwrap().to_string())
            .collect();
        // INFO is filtered by level; the printer error is not relevant.
        assert_eq!(levels, vec!["warning", "critical"]);
    }

    #[test]
    fn partial_lines_wait_for_completion() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "");
        let mut source = LogFileSource::new("pos.exe", &config(&path, false), Span::none());
        source.poll();

        append(&path, "ERROR pos.exe half");
        assert!(source.poll().is_empty());
        append(&path, " a line\n");
        let events = source.poll();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].get("message").unwrap(), "ERROR pos.exe half a line");
    }

    #[test]
    fn oversized_line_is_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        let long_line = "x".repeat(5 * 1024 * 1024);
        append(&path, &long_line);
        append(&path, "\nERROR pos.exe crashed hard\n");

        let mut source = LogFileSource::new("pos.exe", &config(&path, true), Span::none());
        let events: Vec<_> = (0..3).flat_map(|_| source.poll()).collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].get("message").unwrap(), "ERROR pos.exe crashed hard");
        assert_eq!(events[0].get("offset").unwrap(), long_line.len() as u64 + 1);
        assert!(source.poll().is_empty());
    }

    #[test]
    fn truncation_resets_cursor() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        append(&path, "INFO filler line that is fairly long\n");
        let mut source = LogFileSource::new("pos.exe", &config(&path, false), Span::none());
        source.poll();

        std::fs::write(&path, "ERROR pos.exe\n").unwrap();
        let events = source.poll();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].get("offset").unwrap(), 0);
    }

    #[test]
    fn unknown_levels_are_ignored() {
        let cfg = EventLogConfig {
            levels: vec!["Error".into(), "bogus".into(), "error".into()],
            ..EventLogConfig::default()
        };
        let source = LogFileSource::new("pos.exe", &cfg, Span::none());
        assert_eq!(source.levels, vec![Severity::Error]);
    }

    #[test]
    fn missing_files_are_skipped() {
        let dir = tempdir().unwrap();
        let mut source = LogFileSource::new(
            "pos.exe",
            &config(&dir.path().join("absent.log"), true),
            Span::none(),
        );
        assert!(source.poll().is_empty());
    }
}
