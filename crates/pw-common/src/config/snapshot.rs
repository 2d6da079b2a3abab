//! Configuration snapshot logged at agent startup.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ConfigResolution;

/// Where the active configuration came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    /// Timestamp when snapshot was created
    pub snapshot_at: DateTime<Utc>,
    /// Config file path, or None for built-in defaults
    pub path: Option<PathBuf>,
    /// SHA-256 of the file contents
    pub hash: Option<String>,
    pub resolution: ConfigResolution,
}

impl ConfigSnapshot {
    pub fn new(path: Option<PathBuf>, hash: Option<String>, resolution: ConfigResolution) -> Self {
        ConfigSnapshot {
            snapshot_at: Utc::now(),
            path,
            hash,
            resolution,
        }
    }

    /// Short label for log lines: `cli:/etc/procwatch.json` or `default`.
    pub fn describe(&self) -> String {
        match &self.path {
            Some(path) => format!("{}:{}", self.resolution, path.display()),
            None => self.resolution.to_string(),
        }
    }
}
