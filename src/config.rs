//! Configuration loader and validator for the inventory sync client.
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub remote: Remote,
    #[serde(default)]
    pub connectivity: Connectivity,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Period of the background replay timer.
    pub replay_interval_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

/// Inventory service endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Remote {
    pub base_url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

/// Health probe that drives the online/offline signal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Connectivity {
    pub probe_path: String,
    pub probe_interval_ms: u64,
}

impl Default for Connectivity {
    fn default() -> Self {
        Self {
            probe_path: "health".into(),
            probe_interval_ms: 30_000,
        }
    }
}

fn default_max_retries() -> u32 {
    crate::queue::DEFAULT_MAX_RETRIES
}

fn default_timeout_ms() -> u64 {
    10_000
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    pub fn default_database_url(&self) -> String {
        format!(
            "sqlite://{}/inventory.db",
            self.app.data_dir.trim_end_matches('/')
        )
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.replay_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.replay_interval_ms must be > 0"));
    }

    let url = Url::parse(&cfg.remote.base_url)
        .map_err(|_| ConfigError::Invalid("remote.base_url must be a valid URL"))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ConfigError::Invalid("remote.base_url must use http or https"));
    }
    if !url.path().ends_with('/') {
        return Err(ConfigError::Invalid("remote.base_url must end with '/'"));
    }
    if cfg.remote.timeout_ms == 0 {
        return Err(ConfigError::Invalid("remote.timeout_ms must be > 0"));
    }

    if cfg.connectivity.probe_path.trim().is_empty() {
        return Err(ConfigError::Invalid("connectivity.probe_path must be non-empty"));
    }
    if cfg.connectivity.probe_interval_ms == 0 {
        return Err(ConfigError::Invalid("connectivity.probe_interval_ms must be > 0"));
    }

    Ok(())
}

/// Example configuration printed by `inventory-sync example-config`.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  replay_interval_ms: 30000
  max_retries: 5

remote:
  base_url: "http://localhost:3000/api/"
  token: ""
  timeout_ms: 10000

connectivity:
  probe_path: "health"
  probe_interval_ms: 30000
"#
}
