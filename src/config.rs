use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::CacheOptions;

const CONFIG_FILE_NAME: &str = "config.toml";
const APP_DIR: &str = "music-locker";
const CSRF_TOKEN_ENV: &str = "MUSIC_LOCKER_CSRF_TOKEN";

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub cache: CacheConfig,
    pub queue: QueueConfig,
    pub api: ApiConfig,
}

/// Where the cache lives on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file (empty = default data dir)
    pub path: Option<String>,
    /// Hard limit on stored bytes; writes beyond it trigger eviction
    pub quota_bytes: Option<u64>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: None,
            quota_bytes: Some(10 * 1024 * 1024),
        }
    }
}

/// Cache envelope settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Prefix for every key this app writes
    pub key_prefix: String,
    /// Bump to invalidate every cached entry
    pub version: u32,
    /// Usage above this logs a warning; nothing is evicted
    pub soft_cap_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let options = CacheOptions::default();
        Self {
            key_prefix: options.prefix,
            version: options.version,
            soft_cap_bytes: options.soft_cap_bytes,
        }
    }
}

impl CacheConfig {
    pub fn options(&self) -> CacheOptions {
        CacheOptions {
            prefix: self.key_prefix.clone(),
            version: self.version,
            soft_cap_bytes: self.soft_cap_bytes,
        }
    }
}

/// Offline action queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Retry cycles before an action is marked failed
    pub max_retries: u32,
    /// Backoff grows as multiplier^retries seconds
    pub backoff_multiplier: f64,
    /// Upper bound on a single backoff
    pub max_backoff_secs: u64,
    /// Pause between actions within one sync pass
    pub item_delay_ms: u64,
    /// How often finished items and expired cache entries are purged
    pub cleanup_interval_secs: u64,
    /// How often to check for actions whose backoff has elapsed
    pub retry_poll_secs: u64,
    /// Completed and failed items older than this are purged
    pub retention_days: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_multiplier: 2.0,
            max_backoff_secs: 60,
            item_delay_ms: 200,
            cleanup_interval_secs: 300,
            retry_poll_secs: 5,
            retention_days: 7,
        }
    }
}

impl QueueConfig {
    /// Delay before retry number `retries`, capped at `max_backoff_secs`.
    pub fn retry_delay(&self, retries: u32) -> Duration {
        let max = Duration::from_secs(self.max_backoff_secs);
        let secs = self.backoff_multiplier.powi(retries as i32);
        if !secs.is_finite() || secs < 0.0 {
            return max;
        }
        Duration::try_from_secs_f64(secs).map_or(max, |d| d.min(max))
    }

    pub fn item_delay(&self) -> Duration {
        Duration::from_millis(self.item_delay_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    pub fn retry_poll(&self) -> Duration {
        Duration::from_secs(self.retry_poll_secs.max(1))
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days.saturating_mul(24 * 3600))
    }
}

/// Music Locker server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL of the web app
    pub base_url: String,
    /// CSRF token (overridden by MUSIC_LOCKER_CSRF_TOKEN)
    pub csrf_token: Option<String>,
    /// Session cookie sent with every request, e.g. "PHPSESSID=..."
    pub session_cookie: Option<String>,
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            csrf_token: None,
            session_cookie: None,
            timeout_secs: 15,
        }
    }
}

impl ApiConfig {
    /// Token from the environment, falling back to the config file
    pub fn resolved_csrf_token(&self) -> Option<String> {
        std::env::var(CSRF_TOKEN_ENV)
            .ok()
            .filter(|t| !t.is_empty())
            .or_else(|| self.csrf_token.clone().filter(|t| !t.is_empty()))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

impl Config {
    /// Get the configuration file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join(APP_DIR);

        fs::create_dir_all(&config_dir)
            .context("Failed to create config directory")?;

        Ok(config_dir.join(CONFIG_FILE_NAME))
    }

    /// Load configuration from the default path, or create it if missing
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if path.exists() {
            Self::load_from(&path)
        } else {
            let config = Config::default();
            config.save_to(&path)?;
            Ok(config)
        }
    }

    /// Load configuration from an explicit file
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Save configuration to the default path
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    fn save_to(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        fs::write(path, contents)
            .context("Failed to write config file")?;

        Ok(())
    }

    /// Resolved database file for the cache
    pub fn storage_path(&self) -> Result<PathBuf> {
        match self.storage.path.as_deref().filter(|p| !p.is_empty()) {
            Some(path) => Ok(PathBuf::from(path)),
            None => crate::storage::RedbBackend::default_path(),
        }
    }

    /// Generate example config content for documentation
    pub fn example_config() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}
