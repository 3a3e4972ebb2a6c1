use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

const CONFIG_FILE_NAME: &str = "config.toml";

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend: BackendConfig,
    pub catalog: CatalogConfig,
    pub sync: SyncConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            catalog: CatalogConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

/// Remote backend connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Backend REST endpoint, e.g. "https://cloud.example.com/v1"
    pub endpoint: String,
    /// Project identifier sent with every request
    pub project_id: String,
    /// API key (empty = unauthenticated, local-only mode)
    pub api_key: String,
    /// Database identifier containing the app tables
    pub database_id: String,
    /// Acting user id; sync is skipped when empty
    pub user_id: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            project_id: String::new(),
            api_key: String::new(),
            database_id: "watchfolio".to_string(),
            user_id: String::new(),
        }
    }
}

/// Content catalog (TMDB) settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Catalog API base URL
    pub base_url: String,
    /// Bearer token for the catalog API
    pub api_token: String,
    /// Maximum in-memory detail cache entries
    pub cache_capacity: usize,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.themoviedb.org/3".to_string(),
            api_token: String::new(),
            cache_capacity: 200,
        }
    }
}

/// Sync tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Enable automatic background sync
    pub auto_sync: bool,
    /// Quiet window after a local mutation before a sync pass, in milliseconds
    pub debounce_ms: u64,
    /// Periodic re-poll interval in seconds
    pub poll_interval_secs: u64,
    /// Endpoint probed to verify actual internet reachability
    pub probe_endpoint: String,
    /// Probe request timeout in milliseconds
    pub probe_timeout_ms: u64,
    /// How long a probe result stays cached, in milliseconds
    pub probe_cache_ms: u64,
    /// Merge strategy for downloads: "smart", "overwrite", or "skip"
    pub merge_strategy: String,
    /// Keep a locally-favorited entry favorited even if the incoming copy isn't
    pub keep_existing_favorites: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            auto_sync: true,
            debounce_ms: 2000,
            poll_interval_secs: 30,
            probe_endpoint: "https://www.cloudflare.com/cdn-cgi/trace".to_string(),
            probe_timeout_ms: 3000,
            probe_cache_ms: 5000,
            merge_strategy: "smart".to_string(),
            keep_existing_favorites: true,
        }
    }
}

impl Config {
    /// Get the configuration file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("watchfolio");

        fs::create_dir_all(&config_dir)
            .context("Failed to create config directory")?;

        Ok(config_dir.join(CONFIG_FILE_NAME))
    }

    /// Load configuration from file, or create default if not exists
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if path.exists() {
            let contents = fs::read_to_string(&path)
                .context("Failed to read config file")?;

            let config: Config = toml::from_str(&contents)
                .context("Failed to parse config file")?;

            Ok(config)
        } else {
            // Create default config and save it
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;

        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        fs::write(&path, contents)
            .context("Failed to write config file")?;

        Ok(())
    }

    /// Generate example config content for documentation
    pub fn example_config() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert!(config.backend.endpoint.is_empty());
        assert_eq!(config.backend.database_id, "watchfolio");
        assert_eq!(config.catalog.base_url, "https://api.themoviedb.org/3");
        assert!(config.sync.auto_sync);
        assert_eq!(config.sync.debounce_ms, 2000);
        assert_eq!(config.sync.poll_interval_secs, 30);
        assert_eq!(config.sync.probe_timeout_ms, 3000);
        assert_eq!(config.sync.probe_cache_ms, 5000);
        assert_eq!(config.sync.merge_strategy, "smart");
        assert!(config.sync.keep_existing_favorites);
    }

    #[test]
    fn test_serialize_deserialize_roundtrip() {
        let config = Config::default();
        let serialized = toml::to_string_pretty(&config).unwrap();
        let deserialized: Config = toml::from_str(&serialized).unwrap();

        assert_eq!(config.backend.database_id, deserialized.backend.database_id);
        assert_eq!(config.sync.debounce_ms, deserialized.sync.debounce_ms);
        assert_eq!(config.sync.probe_endpoint, deserialized.sync.probe_endpoint);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let partial_toml = r#"
[backend]
endpoint = "https://cloud.example.com/v1"
user_id = "user-1"
"#;

        let config: Config = toml::from_str(partial_toml).unwrap();

        // Custom values
        assert_eq!(config.backend.endpoint, "https://cloud.example.com/v1");
        assert_eq!(config.backend.user_id, "user-1");
        // Default values
        assert_eq!(config.backend.database_id, "watchfolio");
        assert_eq!(config.sync.debounce_ms, 2000);
        assert!(config.sync.auto_sync);
    }

    #[test]
    fn test_full_config_parsing() {
        let full_toml = r#"
[backend]
endpoint = "https://cloud.example.com/v1"
project_id = "proj"
api_key = "key"
database_id = "db"
user_id = "user-2"

[catalog]
base_url = "https://catalog.example.com"
api_token = "token"
cache_capacity = 50

[sync]
auto_sync = false
debounce_ms = 500
poll_interval_secs = 60
probe_endpoint = "https://probe.example.com"
probe_timeout_ms = 1000
probe_cache_ms = 2000
merge_strategy = "skip"
keep_existing_favorites = false
"#;

        let config: Config = toml::from_str(full_toml).unwrap();

        assert_eq!(config.backend.project_id, "proj");
        assert_eq!(config.backend.database_id, "db");
        assert_eq!(config.catalog.cache_capacity, 50);
        assert!(!config.sync.auto_sync);
        assert_eq!(config.sync.debounce_ms, 500);
        assert_eq!(config.sync.poll_interval_secs, 60);
        assert_eq!(config.sync.merge_strategy, "skip");
        assert!(!config.sync.keep_existing_favorites);
    }

    #[test]
    fn test_example_config_is_valid() {
        let example = Config::example_config();
        let parsed: Result<Config, _> = toml::from_str(&example);
        assert!(parsed.is_ok(), "Example config should be valid TOML");
    }

    #[test]
    fn test_invalid_toml_returns_error() {
        let invalid_toml = "this is not valid [[ toml";
        let result: Result<Config, _> = toml::from_str(invalid_toml);
        assert!(result.is_err());
    }
}
