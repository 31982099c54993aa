//! Configuration loader and validator for the attendance pipeline.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::sequencer::{ActionSequencer, DayBoundary};

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
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub identity: Identity,
    pub device: Device,
}

/// Server-side settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
    pub max_backoff_seconds: u64,
    /// Fixed UTC offset for the calendar-day boundary; host local time when absent.
    #[serde(default)]
    pub utc_offset_minutes: Option<i32>,
}

/// Identity comparison collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Identity {
    pub endpoint: String,
    pub api_key: String,
    pub timeout_ms: u64,
    pub max_attempts: u32,
    /// Try validation right after persisting instead of waiting for the worker.
    #[serde(default = "default_inline")]
    pub inline: bool,
}

fn default_inline() -> bool {
    true
}

/// Device-side queue settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Device {
    pub queue_path: String,
    pub flush_interval_secs: u64,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` and the
    /// queue file's parent if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if !self.app.data_dir.trim().is_empty() {
            fs::create_dir_all(&self.app.data_dir)?;
        }
        if let Some(parent) = Path::new(&self.device.queue_path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }

    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/attendance.db", self.app.data_dir))
    }

    pub fn device_queue_url(&self) -> String {
        format!("sqlite://{}", self.device.queue_path)
    }

    pub fn photo_root(&self) -> PathBuf {
        Path::new(&self.app.data_dir).join("media")
    }

    pub fn day_boundary(&self) -> DayBoundary {
        DayBoundary::from_offset_minutes(self.app.utc_offset_minutes)
    }

    pub fn sequencer(&self) -> ActionSequencer {
        ActionSequencer::new(self.day_boundary())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.device.flush_interval_secs)
    }

    pub fn identity_timeout(&self) -> Duration {
        Duration::from_millis(self.identity.timeout_ms)
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
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }
    if let Some(minutes) = cfg.app.utc_offset_minutes {
        if minutes.abs() >= 24 * 60 {
            return Err(ConfigError::Invalid(
                "app.utc_offset_minutes must be within (-1440, 1440)",
            ));
        }
    }

    if cfg.identity.endpoint.trim().is_empty() {
        return Err(ConfigError::Invalid("identity.endpoint must be non-empty"));
    }
    if reqwest::Url::parse(&cfg.identity.endpoint).is_err() {
        return Err(ConfigError::Invalid("identity.endpoint must be a valid URL"));
    }
    if cfg.identity.api_key.trim().is_empty() {
        return Err(ConfigError::Invalid("identity.api_key must be non-empty"));
    }
    if cfg.identity.timeout_ms == 0 {
        return Err(ConfigError::Invalid("identity.timeout_ms must be > 0"));
    }
    if cfg.identity.max_attempts == 0 {
        return Err(ConfigError::Invalid("identity.max_attempts must be > 0"));
    }

    if cfg.device.queue_path.trim().is_empty() {
        return Err(ConfigError::Invalid("device.queue_path must be non-empty"));
    }
    if cfg.device.flush_interval_secs == 0 {
        return Err(ConfigError::Invalid("device.flush_interval_secs must be > 0"));
    }

    Ok(())
}

/// Sample configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 500
  max_backoff_seconds: 300
  utc_offset_minutes: -180

identity:
  endpoint: "https://faces.example.com/v1/compare"
  api_key: "YOUR_IDENTITY_API_KEY"
  timeout_ms: 15000
  max_attempts: 5
  inline: true

device:
  queue_path: "./data/device-queue.db"
  flush_interval_secs: 30
"#
}
