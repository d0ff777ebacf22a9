//! followgraph configuration file handling
//!
//! Loads and saves ~/.config/followgraph/config.yaml. Every field has a
//! serde default, so an empty file is a valid configuration.

use crate::cache::CacheSettings;
use crate::remote::retry::RetryConfig;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Base directory for followgraph files (~/.config/followgraph)
pub fn default_data_dir() -> PathBuf {
    // Always use ~/.config for consistency across platforms (macOS, Linux)
    let mut path = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    path.push(".config");
    path.push("followgraph");
    path
}

/// Cache behaviour
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Freshness window for follow facts, in seconds
    #[serde(default = "default_follow_ttl")]
    pub follow_ttl_secs: u64,

    /// Freshness window for follower/following counters, in seconds
    #[serde(default = "default_stats_ttl")]
    pub stats_ttl_secs: u64,

    /// Interval between background expiry sweeps, in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Capacity of the change notification channel
    #[serde(default = "default_change_capacity")]
    pub change_channel_capacity: usize,

    /// Key the snapshot is persisted under
    #[serde(default = "default_storage_key")]
    pub storage_key: String,
}

fn default_follow_ttl() -> u64 {
    5 * 60
}

fn default_stats_ttl() -> u64 {
    10 * 60
}

fn default_sweep_interval() -> u64 {
    5 * 60
}

fn default_change_capacity() -> usize {
    256
}

fn default_storage_key() -> String {
    "follow-store".to_string()
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            follow_ttl_secs: default_follow_ttl(),
            stats_ttl_secs: default_stats_ttl(),
            sweep_interval_secs: default_sweep_interval(),
            change_channel_capacity: default_change_capacity(),
            storage_key: default_storage_key(),
        }
    }
}

impl CacheConfig {
    /// Runtime settings for [`crate::cache::SocialGraphCache`]
    pub fn settings(&self) -> CacheSettings {
        CacheSettings {
            follow_ttl: Duration::from_secs(self.follow_ttl_secs),
            stats_ttl: Duration::from_secs(self.stats_ttl_secs),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            change_channel_capacity: self.change_channel_capacity,
            storage_key: self.storage_key.clone(),
        }
    }
}

/// Which persistence backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceBackend {
    #[default]
    Sqlite,
    JsonFile,
    Memory,
}

/// Persistence settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default)]
    pub backend: PersistenceBackend,

    /// Database file (sqlite) or directory (json_file); ignored for memory
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// Enable WAL mode (sqlite only)
    #[serde(default = "default_wal_mode")]
    pub wal_mode: bool,
}

fn default_store_path() -> PathBuf {
    default_data_dir().join("cache.db")
}

fn default_wal_mode() -> bool {
    true
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: PersistenceBackend::default(),
            path: default_store_path(),
            wal_mode: default_wal_mode(),
        }
    }
}

/// Remote follow backend settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Base URL of the follow backend, e.g. https://project.supabase.co
    #[serde(default)]
    pub base_url: Option<String>,

    /// API key sent as `apikey` and bearer token
    #[serde(default)]
    pub api_key: Option<String>,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// How often push subscriptions poll for new events, in seconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Retry attempts for idempotent reads
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First retry backoff in milliseconds
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
}

fn default_timeout() -> u64 {
    10
}

fn default_poll_interval() -> u64 {
    5
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff() -> u64 {
    250
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            timeout_secs: default_timeout(),
            poll_interval_secs: default_poll_interval(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
        }
    }
}

impl RemoteConfig {
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            ..RetryConfig::default()
        }
    }
}

/// followgraph configuration
///
/// Represents the complete ~/.config/followgraph/config.yaml file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowGraphConfig {
    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub persistence: PersistenceConfig,

    #[serde(default)]
    pub remote: RemoteConfig,
}

impl FollowGraphConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from the default path
    pub fn load_default() -> Result<Self> {
        Self::load(Self::default_path())
    }

    /// Load configuration from a specific path
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(crate::FollowGraphError::Config(format!(
                "Config file not found: {}",
                path.display()
            )));
        }

        tracing::info!(path = %path.display(), "Loading followgraph configuration");

        let content = fs::read_to_string(path)?;
        let config: Self = if content.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(&content)?
        };

        tracing::debug!(
            backend = ?config.persistence.backend,
            remote = config.remote.base_url.as_deref().unwrap_or("<none>"),
            "Configuration loaded successfully"
        );

        Ok(config)
    }

    /// Save configuration to the default path
    pub fn save_default(&self) -> Result<()> {
        self.save(Self::default_path())
    }

    /// Save configuration to a specific path
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        tracing::info!(path = %path.display(), "Saving followgraph configuration");

        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml)?;

        Ok(())
    }

    /// Get the default config path (~/.config/followgraph/config.yaml)
    pub fn default_path() -> PathBuf {
        default_data_dir().join("config.yaml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_match_cache_contract() {
        let settings = CacheConfig::default().settings();
        assert_eq!(settings.follow_ttl, Duration::from_secs(300));
        assert_eq!(settings.stats_ttl, Duration::from_secs(600));
        assert_eq!(settings.sweep_interval, Duration::from_secs(300));
        assert_eq!(settings.storage_key, "follow-store");
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = r#"
persistence:
  backend: json_file
  path: /tmp/followgraph
remote:
  base_url: https://example.test
"#;
        let config: FollowGraphConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.persistence.backend, PersistenceBackend::JsonFile);
        assert_eq!(config.persistence.path, PathBuf::from("/tmp/followgraph"));
        assert!(config.persistence.wal_mode);
        assert_eq!(config.remote.base_url.as_deref(), Some("https://example.test"));
        assert_eq!(config.remote.timeout_secs, 10);
        assert_eq!(config.cache, CacheConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.yaml");

        let mut config = FollowGraphConfig::new();
        config.cache.follow_ttl_secs = 60;
        config.remote.base_url = Some("http://localhost:54321".to_string());
        config.save(&path).unwrap();

        let loaded = FollowGraphConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let temp_dir = TempDir::new().unwrap();
        let err = FollowGraphConfig::load(temp_dir.path().join("nope.yaml")).unwrap_err();
        assert!(matches!(err, crate::FollowGraphError::Config(_)));
    }

    #[test]
    fn test_empty_file_is_default() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.yaml");
        fs::write(&path, "").unwrap();
        assert_eq!(FollowGraphConfig::load(&path).unwrap(), FollowGraphConfig::default());
    }
}
