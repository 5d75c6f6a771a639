//! Configuration loader and validator for the upload notification pipeline.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
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
    #[serde(default)]
    pub database: Database,
    pub broker: Broker,
    pub mailer: Mailer,
    #[serde(default)]
    pub history: History,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
}

/// File store settings. Without a url the store lives in `data_dir`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Database {
    #[serde(default)]
    pub url: Option<String>,
}

/// Event channel topology and polling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Broker {
    #[serde(default)]
    pub url: Option<String>,
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
    pub poll_interval_ms: u64,
    pub publish_timeout_ms: u64,
}

/// SMTP settings for the notification mailer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Mailer {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    pub from: String,
    pub subject: String,
    /// Per-message send timeout; 0 disables it.
    #[serde(default)]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct History {
    pub max_page_size: i64,
}

impl Default for History {
    fn default() -> Self {
        Self { max_page_size: 100 }
    }
}

impl App {
    /// Expand a leading `~/` in `data_dir`.
    pub fn resolved_data_dir(&self) -> String {
        if let Some(rest) = self.data_dir.strip_prefix("~/") {
            if let Ok(home) = std::env::var("HOME") {
                return format!("{}/{}", home.trim_end_matches('/'), rest);
            }
        }
        self.data_dir.clone()
    }
}

impl Broker {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

impl Mailer {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_data_dir())
    }

    /// File store URL: `DATABASE_URL`, then `database.url`, then `data_dir`.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .ok()
            .or_else(|| self.database.url.clone())
            .unwrap_or_else(|| format!("sqlite://{}/uploads.db", self.app.resolved_data_dir()))
    }

    /// Broker URL: `BROKER_URL`, then `broker.url`, then `data_dir`.
    pub fn broker_url(&self) -> String {
        std::env::var("BROKER_URL")
            .ok()
            .or_else(|| self.broker.url.clone())
            .unwrap_or_else(|| format!("sqlite://{}/broker.db", self.app.resolved_data_dir()))
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

    if cfg.broker.exchange.trim().is_empty() {
        return Err(ConfigError::Invalid("broker.exchange must be non-empty"));
    }
    if cfg.broker.queue.trim().is_empty() {
        return Err(ConfigError::Invalid("broker.queue must be non-empty"));
    }
    if cfg.broker.routing_key.trim().is_empty() {
        return Err(ConfigError::Invalid("broker.routing_key must be non-empty"));
    }
    if cfg.broker.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("broker.poll_interval_ms must be > 0"));
    }
    if cfg.broker.publish_timeout_ms == 0 {
        return Err(ConfigError::Invalid("broker.publish_timeout_ms must be > 0"));
    }

    if cfg.mailer.host.trim().is_empty() {
        return Err(ConfigError::Invalid("mailer.host must be non-empty"));
    }
    if cfg.mailer.port == 0 {
        return Err(ConfigError::Invalid("mailer.port must be > 0"));
    }
    if cfg.mailer.from.trim().is_empty() {
        return Err(ConfigError::Invalid("mailer.from must be non-empty"));
    }
    if cfg.mailer.subject.trim().is_empty() {
        return Err(ConfigError::Invalid("mailer.subject must be non-empty"));
    }
    if cfg.mailer.username.is_some() != cfg.mailer.password.is_some() {
        return Err(ConfigError::Invalid(
            "mailer.username and mailer.password must be set together",
        ));
    }

    if cfg.history.max_page_size <= 0 {
        return Err(ConfigError::Invalid("history.max_page_size must be > 0"));
    }

    Ok(())
}

/// Returns the example YAML content.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

broker:
  exchange: "user-uploaded-file"
  queue: "user-uploaded-file-created-queue"
  routing_key: "user-uploaded-file.event.created"
  poll_interval_ms: 200
  publish_timeout_ms: 5000

mailer:
  host: "localhost"
  port: 1025
  tls: false
  from: "bgg@mail.com"
  subject: "Your File Upload Confirmation"
  timeout_ms: 30000

history:
  max_page_size: 100
"#
}
