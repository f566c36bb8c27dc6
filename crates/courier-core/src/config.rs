use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::CourierError;

/// Debounce window for collapsing split Telegram messages into one batch.
pub const BATCH_DEBOUNCE_MS: u64 = 200;
/// Maximum wait for in-flight media uploads before a batch proceeds anyway.
pub const UPLOAD_DRAIN_TIMEOUT_SECS: u64 = 10;
/// Minimum interval between streaming display edits.
pub const DISPLAY_EDIT_INTERVAL_MS: u64 = 300;
/// Telegram hard limit on message length.
pub const TELEGRAM_MESSAGE_LIMIT: usize = 4096;

/// Top-level config (courier.toml + COURIER_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourierConfig {
    pub telegram: TelegramConfig,
    pub anthropic: AnthropicConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub transcription: TranscriptionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicConfig {
    /// Path to the secret file holding the API key.
    pub api_key_file: String,
    #[serde(default = "default_anthropic_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub default_model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_host")]
    pub host: String,
    #[serde(default = "default_cache_port")]
    pub port: u16,
    #[serde(default)]
    pub db: u8,
    /// Path to the secret file holding the password; None for unauthenticated.
    pub password_file: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            host: default_cache_host(),
            port: default_cache_port(),
            db: 0,
            password_file: None,
        }
    }
}

impl CacheConfig {
    /// Connection URL. The password, when configured, is read from the
    /// secret file at call time so rotation does not need a restart.
    pub fn url(&self) -> Result<String, CourierError> {
        let auth = match &self.password_file {
            Some(path) => format!(":{}@", read_secret_file(path)?),
            None => String::new(),
        };
        Ok(format!(
            "redis://{}{}:{}/{}",
            auth, self.host, self.port, self.db
        ))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Policy knobs: balance gates, tool pre-checks, topic naming, limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// A new request is allowed while balance is strictly above this.
    /// Zero (the default) permits exactly one overshoot into negative.
    #[serde(default)]
    pub minimum_balance_for_request: Decimal,
    #[serde(default = "bool_true")]
    pub tool_cost_precheck_enabled: bool,
    #[serde(default = "default_files_ttl_hours")]
    pub files_api_ttl_hours: u32,
    #[serde(default = "bool_true")]
    pub topic_naming_enabled: bool,
    #[serde(default = "default_topic_naming_model")]
    pub topic_naming_model: String,
    #[serde(default)]
    pub privileged_user_ids: Vec<i64>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_per_user: usize,
    #[serde(default = "default_queue_timeout_secs")]
    pub queue_timeout_secs: u64,
    /// Kept for the file pipeline: metadata resolution stays sequential by
    /// default because the DB session is single-lane.
    #[serde(default)]
    pub parallel_metadata_resolution: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            minimum_balance_for_request: Decimal::ZERO,
            tool_cost_precheck_enabled: true,
            files_api_ttl_hours: default_files_ttl_hours(),
            topic_naming_enabled: true,
            topic_naming_model: default_topic_naming_model(),
            privileged_user_ids: Vec::new(),
            max_concurrent_per_user: default_max_concurrent(),
            queue_timeout_secs: default_queue_timeout_secs(),
            parallel_metadata_resolution: false,
        }
    }
}

/// Code-execution sandbox service.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SandboxConfig {
    pub base_url: Option<String>,
    pub api_key_file: Option<String>,
}

/// Speech-to-text service (OpenAI-compatible transcriptions endpoint).
/// Disabled unless an API key file is configured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    pub api_key_file: Option<String>,
    #[serde(default = "default_transcription_base_url")]
    pub base_url: String,
    #[serde(default = "default_transcription_model")]
    pub model: String,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            api_key_file: None,
            base_url: default_transcription_base_url(),
            model: default_transcription_model(),
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_anthropic_base_url() -> String {
    "https://api.anthropic.com".to_string()
}
fn default_model() -> String {
    "claude-sonnet-4-5".to_string()
}
fn default_cache_host() -> String {
    "redis".to_string()
}
fn default_cache_port() -> u16 {
    6379
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.courier/courier.db")
}
fn default_files_ttl_hours() -> u32 {
    24
}
fn default_topic_naming_model() -> String {
    "claude-haiku-4-5".to_string()
}
fn default_transcription_base_url() -> String {
    "https://api.openai.com".to_string()
}
fn default_transcription_model() -> String {
    "whisper-1".to_string()
}
fn default_max_concurrent() -> usize {
    2
}
fn default_queue_timeout_secs() -> u64 {
    60
}

/// Read a secret value from a mounted file, trimming trailing whitespace.
pub fn read_secret_file(path: &str) -> Result<String, CourierError> {
    std::fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| CourierError::Config(format!("secret file {path}: {e}")))
}

impl CourierConfig {
    /// Load config from a TOML file with COURIER_* env var overrides.
    pub fn load(config_path: Option<&str>) -> Result<Self, CourierError> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("COURIER_").split("_"))
            .extract()
            .map_err(|e| CourierError::Config(e.to_string()))
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{home}/.courier/courier.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_defaults() {
        let p = PolicyConfig::default();
        assert_eq!(p.minimum_balance_for_request, Decimal::ZERO);
        assert!(p.tool_cost_precheck_enabled);
        assert_eq!(p.files_api_ttl_hours, 24);
        assert_eq!(p.max_concurrent_per_user, 2);
        assert!(!p.parallel_metadata_resolution);
    }

    #[test]
    fn cache_url_without_password() {
        let cfg = CacheConfig {
            host: "localhost".into(),
            port: 6379,
            db: 2,
            password_file: None,
        };
        assert_eq!(cfg.url().unwrap(), "redis://localhost:6379/2");
    }

    #[test]
    fn cache_url_reads_password_file() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "s3cret").unwrap();
        let cfg = CacheConfig {
            host: "cache".into(),
            port: 6380,
            db: 0,
            password_file: Some(f.path().to_string_lossy().into_owned()),
        };
        assert_eq!(cfg.url().unwrap(), "redis://:s3cret@cache:6380/0");
    }

    #[test]
    fn missing_secret_file_is_config_error() {
        let err = read_secret_file("/nonexistent/secret").unwrap_err();
        assert!(matches!(err, CourierError::Config(_)));
    }
}
