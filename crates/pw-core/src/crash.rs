//! Termination classification and crash context.
//!
//! Classification is a pure function of the termination status and the
//! exit taxonomy of the platform that produced it:
//!
//! - **Windows**: exit codes are NTSTATUS values or application codes; a
//!   fixed table names the well-known crash statuses, everything else falls
//!   back on the sign of the code.
//! - **Unix**: a fatal signal decides crash vs. graceful stop; plain exit
//!   codes are errors unless they follow the shell's `128 + signal`
//!   convention.

use chrono::{DateTime, Utc};
use pw_common::{Event, EventType};
use serde::{Deserialize, Serialize};

use crate::collect::Termination;
use crate::watch::{PerformanceMetrics, TargetProcess};

/// Exit status conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitTaxonomy {
    Windows,
    Unix,
}

impl ExitTaxonomy {
    /// Taxonomy of the platform the agent runs on.
    pub fn native() -> Self {
        if cfg!(windows) {
            ExitTaxonomy::Windows
        } else {
            ExitTaxonomy::Unix
        }
    }
}

/// Coarse termination category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationKind {
    Crash,
    Error,
    Normal,
    Unknown,
}

impl TerminationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationKind::Crash => "crash",
            TerminationKind::Error => "error",
            TerminationKind::Normal => "normal",
            TerminationKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for TerminationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification result, serialized as `{"type", "description"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    #[serde(rename = "type")]
    pub kind: TerminationKind,
    pub description: String,
}

impl Classification {
    fn new(kind: TerminationKind, description: impl Into<String>) -> Self {
        Classification {
            kind,
            description: description.into(),
        }
    }

    pub fn is_crash(&self) -> bool {
        self.kind == TerminationKind::Crash
    }
}

// ---------------------------------------------------------------------------
// Windows
// ---------------------------------------------------------------------------

const WINDOWS_EXIT_CODES: &[(u32, TerminationKind, &str)] = &[
    (0x0000_0000, TerminationKind::Normal, "Normal termination"),
    (0x0000_0001, TerminationKind::Error, "General error"),
    (0xC000_0005, TerminationKind::Crash, "Access violation"),
    (0xC000_00FD, TerminationKind::Crash, "Stack overflow"),
    (0xC000_001D, TerminationKind::Crash, "Illegal instruction"),
    (0xC000_0094, TerminationKind::Crash, "Integer divide by zero"),
    (0xC000_0017, TerminationKind::Crash, "Out of memory"),
    (0xC000_0409, TerminationKind::Crash, "Stack buffer overrun"),
    (0xC000_0374, TerminationKind::Crash, "Heap corruption"),
    (0xC000_0006, TerminationKind::Crash, "In-page I/O error"),
    (0xC000_0142, TerminationKind::Crash, "DLL initialization failed"),
    (0xCFFF_FFFF, TerminationKind::Crash, "Java OutOfMemoryError"),
    (0xC000_013A, TerminationKind::Error, "User interrupt (Ctrl+C)"),
    (0x4001_0004, TerminationKind::Error, "Terminated by debugger"),
];

/// Classify a Windows exit code.
///
/// Accepts the code either sign-extended (`-1073741819`) or as the raw
/// DWORD (`3221225477`).
pub fn classify_exit_code(code: i64) -> Classification {
    let in_dword_range = (i64::from(i32::MIN)..=i64::from(u32::MAX)).contains(&code);
    let raw = code as u32;

    if in_dword_range {
        if let Some((_, kind, description)) =
            WINDOWS_EXIT_CODES.iter().find(|(value, _, _)| *value == raw)
        {
            return Classification::new(*kind, *description);
        }
    }

    if code == 0 {
        Classification::new(TerminationKind::Normal, "Normal termination")
    } else if code < 0 || (in_dword_range && (raw as i32) < 0) {
        Classification::new(
            TerminationKind::Crash,
            format!("Unknown crash (0x{raw:08X})"),
        )
    } else {
        Classification::new(
            TerminationKind::Error,
            format!("Process exited with code {code}"),
        )
    }
}

// ---------------------------------------------------------------------------
// Unix
// ---------------------------------------------------------------------------

#[cfg(unix)]
mod sig {
    pub use libc::{SIGABRT, SIGBUS, SIGFPE, SIGHUP, SIGILL, SIGINT, SIGKILL, SIGSEGV, SIGSYS, SIGTERM};
}

// Linux numbering, for classifying statuses reported from elsewhere.
#[cfg(not(unix))]
mod sig {
    pub const SIGHUP: i32 = 1;
    pub const SIGINT: i32 = 2;
    pub const SIGILL: i32 = 4;
    pub const SIGABRT: i32 = 6;
    pub const SIGBUS: i32 = 7;
    pub const SIGFPE: i32 = 8;
    pub const SIGKILL: i32 = 9;
    pub const SIGSEGV: i32 = 11;
    pub const SIGTERM: i32 = 15;
    pub const SIGSYS: i32 = 31;
}

/// Highest signal number the shell convention can encode.
const MAX_SIGNAL: i64 = 64;

/// Classify death by signal.
pub fn classify_signal(signal: i32) -> Classification {
    use sig::*;

    let (kind, description) = match signal {
        s if s == SIGSEGV => (TerminationKind::Crash, "Segmentation fault".to_string()),
        s if s == SIGBUS => (TerminationKind::Crash, "Bus error".to_string()),
        s if s == SIGILL => (TerminationKind::Crash, "Illegal instruction".to_string()),
        s if s == SIGFPE => (TerminationKind::Crash, "Floating point exception".to_string()),
        s if s == SIGABRT => (TerminationKind::Crash, "Aborted".to_string()),
        s if s == SIGSYS => (TerminationKind::Crash, "Bad system call".to_string()),
        s if s == SIGKILL => (
            TerminationKind::Crash,
            "Killed (possibly out-of-memory)".to_string(),
        ),
        s if s == SIGINT => (TerminationKind::Error, "User interrupt".to_string()),
        s if s == SIGTERM => (TerminationKind::Normal, "Terminated".to_string()),
        s if s == SIGHUP => (TerminationKind::Normal, "Hangup".to_string()),
        s => (
            TerminationKind::Error,
            format!("Terminated by signal {s} ({})", signal_name(s)),
        ),
    };
    Classification::new(kind, description)
}

/// Classify a Unix exit status.
pub fn classify_unix_exit(code: i64) -> Classification {
    match code {
        0 => Classification::new(TerminationKind::Normal, "Normal termination"),
        c if c > 128 && c <= 128 + MAX_SIGNAL => classify_signal((c - 128) as i32),
        c => Classification::new(
            TerminationKind::Error,
            format!("Process exited with code {c}"),
        ),
    }
}

#[cfg(unix)]
fn signal_name(signal: i32) -> String {
    // SAFETY: strsignal returns a pointer to a NUL-terminated string that
    // stays valid until the next call on this thread; it is copied at once.
    let ptr = unsafe { libc::strsignal(signal) };
    if ptr.is_null() {
        return format!("signal {signal}");
    }
    unsafe { std::ffi::CStr::from_ptr(ptr) }
        .to_string_lossy()
        .into_owned()
}

#[cfg(not(unix))]
fn signal_name(signal: i32) -> String {
    format!("signal {signal}")
}

/// Classify a termination under `taxonomy`.
pub fn classify(termination: Termination, taxonomy: ExitTaxonomy) -> Classification {
    match (termination, taxonomy) {
        (Termination::ExitCode(code), ExitTaxonomy::Windows) => classify_exit_code(code),
        (Termination::ExitCode(code), ExitTaxonomy::Unix) => classify_unix_exit(code),
        (Termination::Signal(signal), _) => classify_signal(signal),
        (Termination::Unknown, _) => {
            Classification::new(TerminationKind::Unknown, "Exit status unavailable")
        }
    }
}

// ---------------------------------------------------------------------------
// Crash context
// ---------------------------------------------------------------------------

/// State captured at the moment the target was found gone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashContext {
    /// Last successful performance sample, if any was taken.
    pub last_metrics: Option<PerformanceMetrics>,
    pub uptime_seconds: f64,
    pub create_time: DateTime<Utc>,
}

impl CrashContext {
    pub fn capture(
        target: &TargetProcess,
        last_metrics: Option<PerformanceMetrics>,
        now: DateTime<Utc>,
    ) -> Self {
        let uptime = (now - target.start_time).num_milliseconds().max(0) as f64 / 1000.0;
        CrashContext {
            last_metrics,
            uptime_seconds: uptime,
            create_time: target.start_time,
        }
    }
}

/// Build the `crash` or `process_terminated` event for a lost target.
pub fn termination_event(
    target: &TargetProcess,
    termination: Termination,
    classification: &Classification,
    context: &CrashContext,
) -> Event {
    let event_type = if classification.is_crash() {
        EventType::Crash
    } else {
        EventType::ProcessTerminated
    };
    let exit_code = match termination {
        Termination::ExitCode(code) => Some(code),
        _ => None,
    };

    let mut event = Event::new(event_type, &target.name)
        .with_pid(target.identity.pid)
        .with("exit_code", exit_code)
        .with("classification", classification)
        .with("crash_context", context);
    if let Termination::Signal(signal) = termination {
        event.insert("signal", signal);
    }
    event
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::ProcessIdentity;
    use proptest::prelude::*;

    fn is_known(code: i64) -> bool {
        WINDOWS_EXIT_CODES
            .iter()
            .any(|(value, _, _)| *value == code as u32)
    }

    #[test]
    fn windows_table_examples() {
        let cases = [
            (0, TerminationKind::Normal, "Normal termination"),
            (-1073741819, TerminationKind::Crash, "Access violation"),
            (-1073741571, TerminationKind::Crash, "Stack overflow"),
            (-805306369, TerminationKind::Crash, "Java OutOfMemoryError"),
            (1, TerminationKind::Error, "General error"),
            (100, TerminationKind::Error, "Process exited with code 100"),
        ];
        for (code, kind, description) in cases {
            let c = classify_exit_code(code);
            assert_eq!(c.kind, kind, "code {code}");
            assert!(c.description.contains(description), "code {code}: {}", c.description);
        }
    }

    #[test]
    fn windows_accepts_raw_dword() {
        let c = classify_exit_code(0xC000_0005);
        assert_eq!(c.kind, TerminationKind::Crash);
        assert_eq!(c.description, "Access violation");
    }

    #[test]
    fn windows_unknown_negative_is_hex_crash() {
        let c = classify_exit_code(-2);
        assert_eq!(c.kind, TerminationKind::Crash);
        assert_eq!(c.description, "Unknown crash (0xFFFFFFFE)");
    }

    #[test]
    fn windows_ctrl_c_is_an_error() {
        let c = classify_exit_code(0xC000_013A_u32 as i32 as i64);
        assert_eq!(c.kind, TerminationKind::Error);
    }

    #[test]
    fn unix_signals() {
        assert_eq!(classify_signal(sig::SIGSEGV).kind, TerminationKind::Crash);
        assert_eq!(classify_signal(sig::SIGABRT).kind, TerminationKind::Crash);
        let kill = classify_signal(sig::SIGKILL);
        assert_eq!(kill.kind, TerminationKind::Crash);
        assert!(kill.description.contains("out-of-memory"));
        assert_eq!(classify_signal(sig::SIGTERM).kind, TerminationKind::Normal);
        assert_eq!(classify_signal(sig::SIGHUP).kind, TerminationKind::Normal);
        assert_eq!(classify_signal(sig::SIGINT).kind, TerminationKind::Error);
    }

    #[test]
    fn unix_shell_status_maps_to_signal() {
        let c = classify_unix_exit(128 + i64::from(sig::SIGSEGV));
        assert_eq!(c.kind, TerminationKind::Crash);
        assert_eq!(c.description, "Segmentation fault");
        assert_eq!(classify_unix_exit(0).kind, TerminationKind::Normal);
        let c = classify_unix_exit(3);
        assert_eq!(c.kind, TerminationKind::Error);
        assert!(c.description.contains('3'));
    }

    #[test]
    fn unknown_status_is_its_own_kind() {
        let c = classify(Termination::Unknown, ExitTaxonomy::Windows);
        assert_eq!(c.kind, TerminationKind::Unknown);
        let c = classify(Termination::Unknown, ExitTaxonomy::Unix);
        assert_eq!(c.kind, TerminationKind::Unknown);
    }

    #[test]
    fn classification_serializes_as_type_and_description() {
        let c = classify_exit_code(-1073741819);
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["type"], "crash");
        assert_eq!(json["description"], "Access violation");
    }

    fn target() -> TargetProcess {
        TargetProcess {
            identity: ProcessIdentity {
                pid: 77,
                start_token: 5,
            },
            name: "YourPOSApp.exe".to_string(),
            start_time: DateTime::parse_from_rfc3339("2024-01-15T09:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        }
    }

    #[test]
    fn crash_event_carries_context() {
        let target = target();
        let now = target.start_time + chrono::Duration::seconds(3600);
        let context = CrashContext::capture(&target, None, now);
        assert!((context.uptime_seconds - 3600.0).abs() < 1e-9);

        let termination = Termination::ExitCode(-1073741819);
        let c = classify(termination, ExitTaxonomy::Windows);
        let event = termination_event(&target, termination, &c, &context);
        assert_eq!(event.event_type, EventType::Crash);
        assert_eq!(event.pid, Some(77));
        assert_eq!(event.get("exit_code").unwrap(), -1073741819);
        assert_eq!(event.get("classification").unwrap()["type"], "crash");
        let ctx = event.get("crash_context").unwrap();
        assert_eq!(ctx["uptime_seconds"], 3600.0);
        assert!(ctx["last_metrics"].is_null());
    }

    #[test]
    fn signal_death_is_reported_with_null_exit_code() {
        let target = target();
        let context = CrashContext::capture(&target, None, target.start_time);
        let termination = Termination::Signal(sig::SIGTERM);
        let c = classify(termination, ExitTaxonomy::Unix);
        let event = termination_event(&target, termination, &c, &context);
        assert_eq!(event.event_type, EventType::ProcessTerminated);
        assert!(event.get("exit_code").unwrap().is_null());
        assert_eq!(event.get("signal").unwrap(), sig::SIGTERM);
    }

    proptest! {
        #[test]
        fn positive_unknown_codes_are_errors(code in 2i64..0x4000_0000) {
            prop_assume!(!is_known(code));
            let c = classify_exit_code(code);
            prop_assert_eq!(c.kind, TerminationKind::Error);
            prop_assert!(c.description.contains(&code.to_string()));
        }

        #[test]
        fn negative_unknown_codes_are_hex_crashes(code in i64::from(i32::MIN)..0) {
            prop_assume!(!is_known(code));
            let c = classify_exit_code(code);
            prop_assert_eq!(c.kind, TerminationKind::Crash);
            let expected = format!("0x{:08X}", code as u32);
            prop_assert!(c.description.contains(&expected));
        }

        #[test]
        fn unix_exit_never_panics(code in any::<i64>()) {
            let c = classify_unix_exit(code);
            prop_assert_eq!(c.kind == TerminationKind::Normal, code == 0 || code == 128 + i64::from(sig::SIGTERM) || code == 128 + i64::from(sig::SIGHUP));
        }
    }
}
