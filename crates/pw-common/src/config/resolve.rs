//! Configuration resolution for the agent.
//!
//! Implements deterministic config resolution order:
//! 1. Explicit CLI flag (--config)
//! 2. Environment variable (PROCWATCH_CONFIG)
//! 3. XDG default (~/.config/procwatch/config.json or config.toml)
//! 4. Built-in defaults

use std::env;
use std::fs;
use std::path::PathBuf;

use sha2::{Digest, Sha256};

use super::{AgentConfig, ConfigFormat, ConfigResolution, ConfigSnapshot};
use crate::error::{Error, Result};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "PROCWATCH_CONFIG";

/// Configuration file paths.
#[derive(Debug, Clone, Default)]
pub struct ConfigPaths {
    /// Explicit config file from the CLI
    pub config_path: Option<PathBuf>,
    /// Override for the XDG config directory (tests)
    pub config_dir: Option<PathBuf>,
}

/// Configuration resolver with deterministic resolution order.
#[derive(Debug)]
pub struct ConfigResolver {
    cli_paths: ConfigPaths,
}

impl ConfigResolver {
    pub fn new(paths: ConfigPaths) -> Self {
        ConfigResolver { cli_paths: paths }
    }

    /// Create a resolver with no CLI overrides.
    pub fn with_defaults() -> Self {
        ConfigResolver {
            cli_paths: ConfigPaths::default(),
        }
    }

    /// Resolve the directory searched for `config.json` / `config.toml`.
    pub fn resolve_config_dir(&self) -> Option<PathBuf> {
        if let Some(ref dir) = self.cli_paths.config_dir {
            return Some(dir.clone());
        }
        if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
            return Some(PathBuf::from(xdg).join("procwatch"));
        }
        dirs::config_dir().map(|d| d.join("procwatch"))
    }

    /// Resolve the config file path and how it was found.
    pub fn resolve_config_path(&self) -> (Option<PathBuf>, ConfigResolution) {
        // 1. CLI flag
        if let Some(ref path) = self.cli_paths.config_path {
            return (Some(path.clone()), ConfigResolution::CliFlag);
        }

        // 2. PROCWATCH_CONFIG env var
        if let Ok(path) = env::var(CONFIG_ENV_VAR) {
            if !path.is_empty() {
                return (Some(PathBuf::from(path)), ConfigResolution::EnvVar);
            }
        }

        // 3. XDG config dir
        if let Some(dir) = self.resolve_config_dir() {
            for name in ["config.json", "config.toml"] {
                let path = dir.join(name);
                if path.exists() {
                    return (Some(path), ConfigResolution::XdgConfig);
                }
            }
        }

        // 4. Default
        (None, ConfigResolution::Default)
    }

    /// Load and validate the configuration.
    ///
    /// An explicitly named file (CLI or env) must exist; a missing XDG file
    /// falls through to defaults.
    pub fn load(&self) -> Result<(AgentConfig, ConfigSnapshot)> {
        let (path, resolution) = self.resolve_config_path();

        match path {
            Some(p) => {
                let content = fs::read_to_string(&p).map_err(|e| {
                    Error::Config(format!("failed to read config from {}: {}", p.display(), e))
                })?;
                let hash = compute_sha256(&content);
                let config = AgentConfig::parse(&content, ConfigFormat::from_path(&p))
                    .map_err(|e| Error::Config(format!("{}: {}", p.display(), e)))?;
                config.validate()?;
                let snapshot = ConfigSnapshot::new(Some(p), Some(hash), resolution);
                Ok((config, snapshot))
            }
            None => {
                let config = AgentConfig::default();
                let snapshot = ConfigSnapshot::new(None, None, ConfigResolution::Default);
                Ok((config, snapshot))
            }
        }
    }
}

/// Compute SHA-256 hash of a string.
pub(crate) fn compute_sha256(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn sha256_hash_is_hex() {
        let hash = compute_sha256("test content");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn cli_path_wins() {
        let mut tmp = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        tmp.write_all(br#"{"monitor": {"process_name": "pos.exe"}}"#)
            .unwrap();

        let resolver = ConfigResolver::new(ConfigPaths {
            config_path: Some(tmp.path().to_path_buf()),
            config_dir: None,
        });
        let (config, snapshot) = resolver.load().unwrap();
        assert_eq!(config.monitor.process_name, "pos.exe");
        assert_eq!(snapshot.resolution, ConfigResolution::CliFlag);
        assert!(snapshot.hash.is_some());
    }

    #[test]
    fn xdg_directory_is_searched() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "[monitor]\nprocess_name = \"till\"\n",
        )
        .unwrap();

        let resolver = ConfigResolver::new(ConfigPaths {
            config_path: None,
            config_dir: Some(dir.path().to_path_buf()),
        });
        let (path, _) = resolver.resolve_config_path();
        // The env var may be set in the test environment; only check the
        // directory lookup when it is not.
        if env::var(CONFIG_ENV_VAR).is_err() {
            assert_eq!(path, Some(dir.path().join("config.toml")));
            let (config, snapshot) = resolver.load().unwrap();
            assert_eq!(config.monitor.process_name, "till");
            assert_eq!(snapshot.resolution, ConfigResolution::XdgConfig);
        }
    }

    #[test]
    fn empty_directory_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let resolver = ConfigResolver::new(ConfigPaths {
            config_path: None,
            config_dir: Some(dir.path().to_path_buf()),
        });
        if env::var(CONFIG_ENV_VAR).is_err() {
            let (config, snapshot) = resolver.load().unwrap();
            assert_eq!(config, AgentConfig::default());
            assert_eq!(snapshot.resolution, ConfigResolution::Default);
            assert!(snapshot.path.is_none());
        }
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let resolver = ConfigResolver::new(ConfigPaths {
            config_path: Some(PathBuf::from("/nonexistent/procwatch.json")),
            config_dir: None,
        });
        assert!(matches!(resolver.load(), Err(Error::Config(_))));
    }

    #[test]
    fn invalid_values_fail_load() {
        let mut tmp = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        tmp.write_all(br#"{"logging": {"batch_size": 0}}"#).unwrap();
        let resolver = ConfigResolver::new(ConfigPaths {
            config_path: Some(tmp.path().to_path_buf()),
            config_dir: None,
        });
        assert!(matches!(resolver.load(), Err(Error::InvalidValue { .. })));
    }
}
