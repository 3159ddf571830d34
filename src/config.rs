//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Storage engine configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Resident cache size that triggers eviction
    #[serde(default = "default_cache_max_bytes")]
    pub cache_max_bytes: usize,

    #[serde(default = "default_eviction_interval")]
    pub eviction_interval_ms: u64,

    /// Level 0 chunk duration
    #[serde(default = "default_base_resolution")]
    pub base_resolution_secs: i64,

    /// Chunk duration growth per level
    #[serde(default = "default_resolution_multiplier")]
    pub resolution_multiplier: i64,

    #[serde(default = "default_max_levels")]
    pub max_levels: u8,
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|p| p.join("profilestore"))
        .unwrap_or_else(|| PathBuf::from("./profilestore_data"))
}

fn default_cache_max_bytes() -> usize {
    256 * 1024 * 1024 // 256 MB
}

fn default_eviction_interval() -> u64 {
    5000 // 5 seconds
}

fn default_base_resolution() -> i64 {
    10
}

fn default_resolution_multiplier() -> i64 {
    10
}

fn default_max_levels() -> u8 {
    8
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            cache_max_bytes: default_cache_max_bytes(),
            eviction_interval_ms: default_eviction_interval(),
            base_resolution_secs: default_base_resolution(),
            resolution_multiplier: default_resolution_multiplier(),
            max_levels: default_max_levels(),
        }
    }
}

/// API server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub cors_origins: Vec<String>,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    4040
}

fn default_request_timeout() -> u64 {
    10_000
}

fn default_max_body_size() -> usize {
    10 * 1024 * 1024 // 10 MB
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: Vec::new(),
            request_timeout_ms: default_request_timeout(),
            max_body_size: default_max_body_size(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let mut config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        config.storage.data_dir = expand_home(&config.storage.data_dir);

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("profilestore").join("config.toml")),
            Some(PathBuf::from("/etc/profilestore/config.toml")),
            Some(PathBuf::from("./profilestore.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                match Self::load_with_env(path) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        // Storage overrides
        if let Some(data_dir) = lookup("PROFILESTORE_DATA_DIR") {
            self.storage.data_dir = expand_home(Path::new(&data_dir));
        }
        if let Some(bytes) = lookup("PROFILESTORE_CACHE_MAX_BYTES") {
            match bytes.parse() {
                Ok(b) => self.storage.cache_max_bytes = b,
                Err(_) => tracing::warn!("Ignoring invalid PROFILESTORE_CACHE_MAX_BYTES: {}", bytes),
            }
        }

        // API overrides
        if let Some(host) = lookup("PROFILESTORE_API_HOST") {
            self.api.host = host;
        }
        if let Some(port) = lookup("PROFILESTORE_API_PORT") {
            match port.parse() {
                Ok(p) => self.api.port = p,
                Err(_) => tracing::warn!("Ignoring invalid PROFILESTORE_API_PORT: {}", port),
            }
        }

        // Logging overrides
        if let Some(level) = lookup("PROFILESTORE_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("PROFILESTORE_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

/// Replace a leading `~` with the home directory
fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Profilestore Configuration
#
# Environment variables override these settings:
# - PROFILESTORE_DATA_DIR
# - PROFILESTORE_CACHE_MAX_BYTES
# - PROFILESTORE_API_HOST
# - PROFILESTORE_API_PORT
# - PROFILESTORE_LOG_LEVEL
# - PROFILESTORE_LOG_FORMAT

[storage]
# Directory holding the profile database
data_dir = "~/.local/share/profilestore"

# Resident cache size above which objects are evicted (bytes)
cache_max_bytes = 268435456

# How often the eviction / write-back cycle runs (ms)
eviction_interval_ms = 5000

# Duration of the finest chunks (seconds)
base_resolution_secs = 10

# Each level's chunks are this many times longer than the level below
resolution_multiplier = 10

# Number of resolution levels
max_levels = 8

[api]
# API server host
host = "0.0.0.0"

# API server port
port = 4040

# Allowed CORS origins (empty allows any)
cors_origins = []

# Request timeout in milliseconds
request_timeout_ms = 10000

# Maximum ingest body size (bytes)
max_body_size = 10485760

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config_parses_to_defaults() {
        let config: Config = toml::from_str(&generate_default_config()).unwrap();
        let defaults = Config::default();

        assert_eq!(config.storage.cache_max_bytes, defaults.storage.cache_max_bytes);
        assert_eq!(config.storage.eviction_interval_ms, 5000);
        assert_eq!(config.storage.base_resolution_secs, 10);
        assert_eq!(config.storage.resolution_multiplier, 10);
        assert_eq!(config.storage.max_levels, 8);
        assert_eq!(config.api.port, 4040);
        assert_eq!(config.api.request_timeout_ms, 10_000);
        assert_eq!(config.api.max_body_size, defaults.api.max_body_size);
        assert_eq!(config.logging.format, "pretty");
    }

    #[test]
    fn test_partial_file_uses_section_defaults() {
        let config: Config = toml::from_str(
            r#"
            [storage]
            data_dir = "/tmp/profiles"

            [api]
            port = 9000
            "#,
        )
        .unwrap();

        assert_eq!(config.storage.data_dir, PathBuf::from("/tmp/profiles"));
        assert_eq!(config.storage.max_levels, 8);
        assert_eq!(config.api.port, 9000);
        assert_eq!(config.api.host, "0.0.0.0");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("PROFILESTORE_DATA_DIR", "/data"),
            ("PROFILESTORE_CACHE_MAX_BYTES", "1024"),
            ("PROFILESTORE_API_PORT", "not-a-port"),
            ("PROFILESTORE_LOG_FORMAT", "json"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_overrides(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.storage.data_dir, PathBuf::from("/data"));
        assert_eq!(config.storage.cache_max_bytes, 1024);
        assert_eq!(config.api.port, 4040);
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home(Path::new("/abs/dir")), PathBuf::from("/abs/dir"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home(Path::new("~/profiles")), home.join("profiles"));
        }
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Path::new("/nonexistent/profilestore.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
