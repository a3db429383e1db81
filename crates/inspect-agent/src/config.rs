//! Agent configuration: YAML file merged with environment overrides.
//!
//! File layout mirrors the sections an operator cares about:
//!
//! ```yaml
//! server:
//!   base_url: https://inspect.example.com
//!   token_file: /var/lib/inspect-agent/token
//! cluster:
//!   kubeconfig_path: /etc/kubernetes/admin.conf
//! prometheus:
//!   base_url: http://prometheus.monitoring:9090
//! agent:
//!   poll_interval_secs: 10
//!   batch_size: 1
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_BATCH_SIZE: u32 = 1;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("server.base_url is required (or set INSPECT_AGENT_SERVER)")]
    MissingServer,
    #[error("no agent token available: set server.token, a token_file, or INSPECT_AGENT_TOKEN")]
    MissingToken,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawConfig {
    server: RawServer,
    cluster: RawCluster,
    prometheus: RawPrometheus,
    agent: RawAgent,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawServer {
    base_url: Option<String>,
    token: Option<String>,
    token_file: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawCluster {
    kubeconfig_path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawPrometheus {
    base_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawAgent {
    poll_interval_secs: Option<u64>,
    batch_size: Option<u32>,
    request_timeout_secs: Option<u64>,
}

/// Resolved agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub server_base: String,
    pub token: Option<String>,
    pub token_file: Option<PathBuf>,
    pub kubeconfig_path: Option<PathBuf>,
    pub prometheus_url: Option<String>,
    pub poll_interval: Duration,
    pub batch_size: u32,
    pub request_timeout: Duration,
}

impl AgentConfig {
    /// Load from an optional YAML file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let raw = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)?;
                serde_yaml::from_str::<RawConfig>(&content)?
            }
            None => RawConfig::default(),
        };
        Self::resolve(raw)
    }

    fn resolve(raw: RawConfig) -> Result<Self, ConfigError> {
        let env = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());

        let server_base = env("INSPECT_AGENT_SERVER")
            .or(raw.server.base_url)
            .ok_or(ConfigError::MissingServer)?
            .trim_end_matches('/')
            .to_string();

        let poll_interval_secs = env("INSPECT_AGENT_POLL_INTERVAL")
            .and_then(|v| v.parse().ok())
            .or(raw.agent.poll_interval_secs)
            .unwrap_or(DEFAULT_POLL_INTERVAL_SECS);
        let batch_size = env("INSPECT_AGENT_BATCH_SIZE")
            .and_then(|v| v.parse().ok())
            .or(raw.agent.batch_size)
            .unwrap_or(DEFAULT_BATCH_SIZE)
            .max(1);
        let request_timeout_secs = env("INSPECT_AGENT_TIMEOUT")
            .and_then(|v| v.parse().ok())
            .or(raw.agent.request_timeout_secs)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);

        Ok(Self {
            server_base,
            token: env("INSPECT_AGENT_TOKEN").or(raw.server.token),
            token_file: env("INSPECT_AGENT_TOKEN_FILE")
                .map(PathBuf::from)
                .or(raw.server.token_file),
            kubeconfig_path: env("INSPECT_AGENT_KUBECONFIG")
                .map(PathBuf::from)
                .or(raw.cluster.kubeconfig_path),
            prometheus_url: env("INSPECT_AGENT_PROM_URL").or(raw.prometheus.base_url),
            poll_interval: Duration::from_secs(poll_interval_secs.max(1)),
            batch_size,
            request_timeout: Duration::from_secs(request_timeout_secs.max(1)),
        })
    }

    /// The bearer token: inline config first, then the token file.
    pub fn load_token(&self) -> Result<String, ConfigError> {
        if let Some(token) = &self.token {
            return Ok(token.clone());
        }
        if let Some(path) = &self.token_file {
            if path.exists() {
                let token = std::fs::read_to_string(path)?.trim().to_string();
                if !token.is_empty() {
                    return Ok(token);
                }
            }
        }
        Err(ConfigError::MissingToken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_yaml_sections() {
        let yaml = r"
server:
  base_url: https://inspect.example.com/
  token: abc123
cluster:
  kubeconfig_path: /etc/kubernetes/admin.conf
prometheus:
  base_url: http://prom:9090
agent:
  poll_interval_secs: 30
  batch_size: 4
";
        let raw: RawConfig = serde_yaml::from_str(yaml).unwrap();
        let config = AgentConfig::resolve(raw).unwrap();
        assert_eq!(config.server_base, "https://inspect.example.com");
        assert_eq!(config.token.as_deref(), Some("abc123"));
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.batch_size, 4);
        assert_eq!(
            config.kubeconfig_path.as_deref(),
            Some(Path::new("/etc/kubernetes/admin.conf"))
        );
    }

    #[test]
    fn missing_server_is_an_error() {
        let result = AgentConfig::resolve(RawConfig::default());
        assert!(matches!(result, Err(ConfigError::MissingServer)));
    }

    #[test]
    fn token_file_is_read_and_trimmed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "  file-token  ").unwrap();

        let raw: RawConfig = serde_yaml::from_str(&format!(
            "server:\n  base_url: http://localhost:7800\n  token_file: {}\n",
            file.path().display()
        ))
        .unwrap();
        let config = AgentConfig::resolve(raw).unwrap();
        assert_eq!(config.load_token().unwrap(), "file-token");
    }

    #[test]
    fn missing_token_everywhere_is_an_error() {
        let raw: RawConfig =
            serde_yaml::from_str("server:\n  base_url: http://localhost:7800\n").unwrap();
        let config = AgentConfig::resolve(raw).unwrap();
        assert!(matches!(config.load_token(), Err(ConfigError::MissingToken)));
    }
}
