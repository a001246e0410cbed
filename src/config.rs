//! Configuration loader and validator for the cleanup tool.
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
    pub cleanup: Cleanup,
    /// Identifiers always kept, in addition to the stored preferences.
    #[serde(default)]
    pub whitelist: Vec<String>,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub log_dir: String,
    #[serde(default = "default_session")]
    pub session: String,
}

/// Session gateway the engine talks to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Remote {
    pub base_url: String,
    pub token: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// Pacing and retry knobs. Every field is optional in YAML.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Cleanup {
    pub warmup_secs: u64,
    pub batch_pause_secs: u64,
    pub action_gap_ms: u64,
    /// `None` picks a size from the number of pending conversations.
    pub batch_size: Option<usize>,
    pub max_quota_attempts: u32,
    pub max_quota_wait_secs: u64,
    pub transient_attempts: u32,
    pub transient_backoff_secs: u64,
    pub verification_passes: u32,
    pub verification_settle_secs: u64,
}

impl Default for Cleanup {
    fn default() -> Self {
        Self {
            warmup_secs: 5,
            batch_pause_secs: 10,
            action_gap_ms: 500,
            batch_size: None,
            max_quota_attempts: 10,
            max_quota_wait_secs: 300,
            transient_attempts: 3,
            transient_backoff_secs: 30,
            verification_passes: 4,
            verification_settle_secs: 5,
        }
    }
}

fn default_session() -> String {
    "telegram_cleanup".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` and `app.log_dir`).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        fs::create_dir_all(&self.app.data_dir)?;
        fs::create_dir_all(&self.app.log_dir)
    }

    /// SQLite URL for this session, unless `DATABASE_URL` overrides it.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            format!(
                "sqlite://{}/{}.db",
                self.app.data_dir.trim_end_matches('/'),
                self.app.session
            )
        })
    }
}

/// Comma separated entries from the `WHITELIST` environment variable.
pub fn env_whitelist() -> Vec<String> {
    std::env::var("WHITELIST")
        .map(|raw| split_entries(&raw))
        .unwrap_or_default()
}

fn split_entries(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
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
    if cfg.app.log_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.log_dir must be non-empty"));
    }
    if cfg.app.session.trim().is_empty() {
        return Err(ConfigError::Invalid("app.session must be non-empty"));
    }

    if cfg.remote.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("remote.base_url must be non-empty"));
    }
    if cfg.remote.token.trim().is_empty() {
        return Err(ConfigError::Invalid("remote.token must be non-empty"));
    }
    if cfg.remote.timeout_secs == 0 {
        return Err(ConfigError::Invalid("remote.timeout_secs must be > 0"));
    }

    let c = &cfg.cleanup;
    if let Some(size) = c.batch_size {
        if !(crate::scheduler::MIN_BATCH..=crate::scheduler::MAX_BATCH).contains(&size) {
            return Err(ConfigError::Invalid("cleanup.batch_size must be within 5..=20"));
        }
    }
    if c.max_quota_attempts == 0 {
        return Err(ConfigError::Invalid("cleanup.max_quota_attempts must be > 0"));
    }
    if c.transient_attempts == 0 {
        return Err(ConfigError::Invalid("cleanup.transient_attempts must be > 0"));
    }
    if c.verification_passes == 0 {
        return Err(ConfigError::Invalid("cleanup.verification_passes must be > 0"));
    }

    Ok(())
}

/// Returns a documented example configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  log_dir: "./logs"
  session: "telegram_cleanup"

remote:
  base_url: "http://127.0.0.1:8080/"
  token: "YOUR_SESSION_TOKEN"
  timeout_secs: 30

# Every key below is optional; the values shown are the defaults.
cleanup:
  warmup_secs: 5
  batch_pause_secs: 10
  action_gap_ms: 500
  batch_size: ~            # ~ = automatic, between 5 and 20
  max_quota_attempts: 10
  max_quota_wait_secs: 300
  transient_attempts: 3
  transient_backoff_secs: 30
  verification_passes: 4
  verification_settle_secs: 5

whitelist:
  - "@my_own_bot"
  - "https://t.me/favourite_channel"
  - "Family"
"#
}
