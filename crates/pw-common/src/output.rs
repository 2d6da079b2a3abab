//! Output format specifications.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// How `pw-agent` prints command results on stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Pretty-printed JSON
    #[default]
    Json,

    /// One compact JSON document per line, same shape as the telemetry files
    Jsonl,

    /// One-line summary for quick status checks
    Summary,
}

impl OutputFormat {
    /// Render `value`; `summary` is only called for [`OutputFormat::Summary`].
    pub fn render<T: Serialize>(
        self,
        value: &T,
        summary: impl FnOnce() -> String,
    ) -> serde_json::Result<String> {
        match self {
            OutputFormat::Json => serde_json::to_string_pretty(value),
            OutputFormat::Jsonl => serde_json::to_string(value),
            OutputFormat::Summary => Ok(summary()),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Jsonl => write!(f, "jsonl"),
            OutputFormat::Summary => write!(f, "summary"),
        }
    }
}
