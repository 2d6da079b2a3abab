//! The event record shared by every producer.
//!
//! An [`Event`] is an immutable envelope (`timestamp`, `type`,
//! `process_name`, optional `pid`) plus a type-specific payload. On disk
//! the payload is flattened next to the envelope fields, one compact JSON
//! object per line:
//!
//! ```json
//! {"timestamp":"2026-03-01T12:00:00.250Z","type":"hang","process_name":"pos.exe","pid":4242,"duration_seconds":0.0}
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Type-specific event payload.
pub type Payload = serde_json::Map<String, Value>;

/// Keys owned by the envelope; payload entries may not shadow them.
pub const RESERVED_KEYS: [&str; 4] = ["timestamp", "type", "process_name", "pid"];

/// Kind of an [`Event`].
///
/// Events produced by the agent use the named variants. Anything an
/// external source reports is carried verbatim in [`EventType::External`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    Performance,
    ProcessStarted,
    ProcessTerminated,
    Crash,
    Hang,
    HangUpdate,
    HangRecovery,
    MonitorStarted,
    MonitorStopped,
    SelfMonitor,
    ResourceLimitExceeded,
    EventLog,
    External(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            EventType::Performance => "performance",
            EventType::ProcessStarted => "process_started",
            EventType::ProcessTerminated => "process_terminated",
            EventType::Crash => "crash",
            EventType::Hang => "hang",
            EventType::HangUpdate => "hang_update",
            EventType::HangRecovery => "hang_recovery",
            EventType::MonitorStarted => "monitor_started",
            EventType::MonitorStopped => "monitor_stopped",
            EventType::SelfMonitor => "self_monitor",
            EventType::ResourceLimitExceeded => "resource_limit_exceeded",
            EventType::EventLog => "event_log",
            EventType::External(name) => name,
        }
    }

    /// Whether this event reports the end of the target process.
    pub fn is_termination(&self) -> bool {
        matches!(self, EventType::Crash | EventType::ProcessTerminated)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an empty event type name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmptyEventType;

impl fmt::Display for EmptyEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("event type must not be empty")
    }
}

impl std::error::Error for EmptyEventType {}

impl FromStr for EventType {
    type Err = EmptyEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s {
            "" => return Err(EmptyEventType),
            "performance" => EventType::Performance,
            "process_started" => EventType::ProcessStarted,
            "process_terminated" => EventType::ProcessTerminated,
            "crash" => EventType::Crash,
            "hang" => EventType::Hang,
            "hang_update" => EventType::HangUpdate,
            "hang_recovery" => EventType::HangRecovery,
            "monitor_started" => EventType::MonitorStarted,
            "monitor_stopped" => EventType::MonitorStopped,
            "self_monitor" => EventType::SelfMonitor,
            "resource_limit_exceeded" => EventType::ResourceLimitExceeded,
            "event_log" => EventType::EventLog,
            other => EventType::External(other.to_string()),
        };
        Ok(kind)
    }
}

impl Serialize for EventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

/// A single observation destined for the telemetry log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub process_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(flatten)]
    pub payload: Payload,
}

impl Event {
    /// Create an event stamped with the current time.
    pub fn new(event_type: EventType, process_name: impl Into<String>) -> Self {
        Event {
            timestamp: Utc::now(),
            event_type,
            process_name: process_name.into(),
            pid: None,
            payload: Payload::new(),
        }
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Add a payload field. Reserved envelope keys are ignored.
    pub fn with(mut self, key: &str, value: impl Serialize) -> Self {
        self.insert(key, value);
        self
    }

    /// Insert a payload field, returning `false` if the key is reserved.
    pub fn insert(&mut self, key: &str, value: impl Serialize) -> bool {
        if RESERVED_KEYS.contains(&key) {
            return false;
        }
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.payload.insert(key.to_string(), value);
        true
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// Serialize as a single compact JSON line (without the newline).
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Parse one persisted line back into an event.
    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line.trim_end_matches(['\r', '\n']))
    }
}
