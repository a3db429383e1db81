//! Daemon configuration: TOML file merged over defaults.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::scheduler::DEFAULT_MAX_CONCURRENT_RUNS;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Path to the SQLite database.
    pub db_path: PathBuf,
    /// HTTP server port.
    pub port: u16,
    /// Maximum concurrent locally-executed runs.
    pub max_concurrent_runs: usize,
    /// Seed the built-in default checks into an empty catalog at startup.
    pub seed_default_items: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            db_path: default_data_dir().join("inspectd.db"),
            port: 7800,
            max_concurrent_runs: DEFAULT_MAX_CONCURRENT_RUNS,
            seed_default_items: true,
        }
    }
}

/// Default data directory (~/.local/share/inspectd).
fn default_data_dir() -> PathBuf {
    let data_dir = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".local/share")
        });
    data_dir.join("inspectd")
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load from an optional config file; defaults when none is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }
}
