//! Configuration management for Reelcast

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, Result};
use crate::types::PlatformId;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub credentials: CredentialKeyConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub platforms: PlatformsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

/// Where the process-wide credential key lives
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialKeyConfig {
    /// File containing an age X25519 identity (`AGE-SECRET-KEY-1...`)
    #[serde(default = "default_key_file")]
    pub key_file: String,
}

fn default_key_file() -> String {
    "~/.config/reelcast/credential.key".to_string()
}

impl Default for CredentialKeyConfig {
    fn default() -> Self {
        Self {
            key_file: default_key_file(),
        }
    }
}

/// Scheduler and refresher tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub worker_pool_size: usize,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub refresh_safety_margin_seconds: i64,
    pub per_platform_concurrency_cap: HashMap<PlatformId, usize>,
    pub queue_capacity: usize,
    /// Delay used when a platform rate-limits without saying for how long
    pub rate_limit_floor_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 4,
            max_retries: 3,
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            refresh_safety_margin_seconds: 300,
            per_platform_concurrency_cap: HashMap::new(),
            queue_capacity: 1_024,
            rate_limit_floor_ms: 5_000,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.worker_pool_size == 0 {
            return Err(invalid("engine.worker_pool_size", "must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(invalid("engine.queue_capacity", "must be at least 1"));
        }
        if self.backoff_base_ms == 0 {
            return Err(invalid("engine.backoff_base_ms", "must be at least 1"));
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(invalid(
                "engine.backoff_max_ms",
                "must not be smaller than backoff_base_ms",
            ));
        }
        if self.refresh_safety_margin_seconds < 0 {
            return Err(invalid(
                "engine.refresh_safety_margin_seconds",
                "must not be negative",
            ));
        }
        if let Some((platform, _)) = self
            .per_platform_concurrency_cap
            .iter()
            .find(|(_, cap)| **cap == 0)
        {
            return Err(invalid(
                &format!("engine.per_platform_concurrency_cap.{}", platform),
                "must be at least 1",
            ));
        }
        Ok(())
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn rate_limit_floor(&self) -> Duration {
        Duration::from_millis(self.rate_limit_floor_ms)
    }
}

fn invalid(field: &str, reason: &str) -> crate::error::ReelcastError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlatformsConfig {
    pub youtube: Option<YouTubeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YouTubeConfig {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_google_token_url")]
    pub token_url: String,
    #[serde(default = "default_youtube_api_base")]
    pub api_base: String,
    /// Privacy status applied to new uploads
    #[serde(default = "default_privacy_status")]
    pub privacy_status: String,
}

fn default_google_token_url() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

fn default_youtube_api_base() -> String {
    "https://www.googleapis.com".to_string()
}

fn default_privacy_status() -> String {
    "private".to_string()
}

impl Config {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config = toml::from_str(&content).map_err(ConfigError::ParseError)?;
        config.engine.validate()?;
        Ok(config)
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            database: DatabaseConfig {
                path: "~/.local/share/reelcast/reelcast.db".to_string(),
            },
            credentials: CredentialKeyConfig::default(),
            engine: EngineConfig::default(),
            platforms: PlatformsConfig::default(),
        }
    }
}

/// Resolve the configuration file path following XDG Base Directory spec
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("REELCAST_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("reelcast").join("config.toml"))
}

/// Expand `~` in a configured path
pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).to_string())
}
