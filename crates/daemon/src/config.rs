//! Configuration management for the Depot daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/depot/config.toml`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default address the SFTP listener binds to.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:2222";

/// Largest READ length that still fits in a single DATA packet.
pub const MAX_READ_LEN: u32 = (protocol::MAX_PACKET_SIZE - 9) as u32;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("listen_addr must be a socket address like 0.0.0.0:2222, got {0}")]
    InvalidListenAddr(String),

    #[error("max_connections must be between 1 and 10000, got {0}")]
    InvalidMaxConnections(usize),

    #[error("handshake_timeout_secs must be between 1 and 600, got {0}")]
    InvalidHandshakeTimeout(u64),

    #[error("max_auth_retries must be between 1 and 100, got {0}")]
    InvalidMaxAuthRetries(u32),

    #[error("max_inflight_requests must be between 1 and 4096, got {0}")]
    InvalidMaxInflight(usize),

    #[error("max_read_len must be between 1 and {MAX_READ_LEN}, got {0}")]
    InvalidMaxReadLen(u32),

    #[error("max_open_handles must be between 1 and 65536, got {0}")]
    InvalidMaxOpenHandles(usize),

    #[error("log level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the Depot daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Listener and connection limits.
    pub server: ServerConfig,

    /// Device storage layout and per-session limits.
    pub storage: StorageConfig,

    /// Device directory location.
    pub directory: DirectoryConfig,

    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Listener and connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to accept connections on.
    pub listen_addr: String,

    /// Maximum number of concurrent connections.
    pub max_connections: usize,

    /// Seconds a connection may take to authenticate and negotiate.
    pub handshake_timeout_secs: u64,

    /// Non-credential authentication requests tolerated before disconnecting.
    pub max_auth_retries: u32,

    /// Maximum number of pipelined requests processed at once per session.
    pub max_inflight_requests: usize,
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Base directory; each device gets `<root>/<device id>/`.
    pub root: PathBuf,

    /// Upper bound on a single READ (longer requests are clamped).
    pub max_read_len: u32,

    /// Maximum number of simultaneously open handles per session.
    pub max_open_handles: usize,
}

/// Device directory configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Path to the SQLite device database.
    pub database_path: PathBuf,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,

    /// Directory for daily rolling log files. Logs go to stderr when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,

    /// Permit `debug`/`trace` outside development environments.
    pub allow_debug_in_production: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            max_connections: 64,
            handshake_timeout_secs: 30,
            max_auth_retries: 10,
            max_inflight_requests: 64,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_data_dir().join("storage"),
            max_read_len: 64 * 1024,
            max_open_handles: 256,
        }
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            database_path: default_data_dir().join("devices.db"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
            allow_debug_in_production: false,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("depot")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("depot")
}

/// Whether the process runs in a development environment (`DEPOT_ENV=dev`).
pub fn is_dev_environment() -> bool {
    std::env::var("DEPOT_ENV")
        .map(|v| v.eq_ignore_ascii_case("dev"))
        .unwrap_or(false)
}

impl LoggingConfig {
    /// The level actually handed to the subscriber.
    ///
    /// Outside development, `debug` and `trace` are lowered to `info` unless
    /// explicitly allowed: they include device identifiers and paths.
    pub fn effective_level(&self, dev_environment: bool) -> String {
        let level = self.level.to_lowercase();
        let verbose = level == "debug" || level == "trace";
        if verbose && !dev_environment && !self.allow_debug_in_production {
            return "info".to_string();
        }
        level
    }
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - DEPOT_LISTEN_ADDR: Override listen address
    /// - DEPOT_STORAGE_ROOT: Override storage root
    /// - DEPOT_DATABASE_PATH: Override device database path
    /// - DEPOT_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("DEPOT_LISTEN_ADDR") {
            if !addr.is_empty() {
                tracing::info!("Overriding listen_addr from environment: {}", addr);
                self.server.listen_addr = addr;
            }
        }

        if let Ok(root) = std::env::var("DEPOT_STORAGE_ROOT") {
            if !root.is_empty() {
                tracing::info!("Overriding storage root from environment: {}", root);
                self.storage.root = PathBuf::from(root);
            }
        }

        if let Ok(path) = std::env::var("DEPOT_DATABASE_PATH") {
            if !path.is_empty() {
                tracing::info!("Overriding database_path from environment: {}", path);
                self.directory.database_path = PathBuf::from(path);
            }
        }

        if let Ok(level) = std::env::var("DEPOT_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log level from environment: {}", level);
                self.logging.level = level;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.listen_addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidListenAddr(
                self.server.listen_addr.clone(),
            ));
        }

        if !(1..=10_000).contains(&self.server.max_connections) {
            return Err(ConfigError::InvalidMaxConnections(
                self.server.max_connections,
            ));
        }

        if !(1..=600).contains(&self.server.handshake_timeout_secs) {
            return Err(ConfigError::InvalidHandshakeTimeout(
                self.server.handshake_timeout_secs,
            ));
        }

        if !(1..=100).contains(&self.server.max_auth_retries) {
            return Err(ConfigError::InvalidMaxAuthRetries(
                self.server.max_auth_retries,
            ));
        }

        if !(1..=4096).contains(&self.server.max_inflight_requests) {
            return Err(ConfigError::InvalidMaxInflight(
                self.server.max_inflight_requests,
            ));
        }

        if !(1..=MAX_READ_LEN).contains(&self.storage.max_read_len) {
            return Err(ConfigError::InvalidMaxReadLen(self.storage.max_read_len));
        }

        if !(1..=65_536).contains(&self.storage.max_open_handles) {
            return Err(ConfigError::InvalidMaxOpenHandles(
                self.storage.max_open_handles,
            ));
        }

        let level = self.logging.level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.level.clone()));
        }

        Ok(())
    }

    /// Parsed listen address. Call [`Config::validate`] first.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.server
            .listen_addr
            .parse()
            .with_context(|| format!("Invalid listen address: {}", self.server.listen_addr))
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.server.listen_addr, DEFAULT_LISTEN_ADDR);
        assert_eq!(config.server.max_connections, 64);
        assert_eq!(config.server.handshake_timeout_secs, 30);
        assert_eq!(config.storage.max_read_len, 64 * 1024);
        assert_eq!(config.storage.max_open_handles, 256);
        assert_eq!(config.logging.level, "info");
        assert!(config.logging.directory.is_none());
        assert!(config.storage.root.to_string_lossy().contains("depot"));
        assert!(config
            .directory
            .database_path
            .to_string_lossy()
            .ends_with("devices.db"));
    }

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(Config::default().validate(), Ok(()));
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[server]
listen_addr = "127.0.0.1:2022"

[storage]
max_open_handles = 8
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.server.listen_addr, "127.0.0.1:2022");
        assert_eq!(config.storage.max_open_handles, 8);
        assert_eq!(config.server.max_connections, 64);
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[server]
listen_addr = "127.0.0.1:22"
max_connections = 5
handshake_timeout_secs = 10
max_auth_retries = 3
max_inflight_requests = 16

[storage]
root = "/srv/depot"
max_read_len = 32768
max_open_handles = 32

[directory]
database_path = "/var/lib/depot/devices.db"

[logging]
level = "warn"
directory = "/var/log/depot"
allow_debug_in_production = true
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.server.max_connections, 5);
        assert_eq!(config.server.handshake_timeout_secs, 10);
        assert_eq!(config.server.max_auth_retries, 3);
        assert_eq!(config.server.max_inflight_requests, 16);
        assert_eq!(config.storage.root, PathBuf::from("/srv/depot"));
        assert_eq!(config.storage.max_read_len, 32768);
        assert_eq!(config.storage.max_open_handles, 32);
        assert_eq!(
            config.directory.database_path,
            PathBuf::from("/var/lib/depot/devices.db")
        );
        assert_eq!(config.logging.level, "warn");
        assert_eq!(
            config.logging.directory,
            Some(PathBuf::from("/var/log/depot"))
        );
        assert!(config.logging.allow_debug_in_production);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let result = Config::from_toml("[server\nlisten_addr = 1");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[storage]
max_open_handles = "many"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut original = Config::default();
        original.server.listen_addr = "127.0.0.1:4000".to_string();
        original.logging.directory = Some(PathBuf::from("/tmp/depot-logs"));
        original.storage.max_read_len = 1024;

        let toml = original.to_toml().unwrap();
        let loaded = Config::from_toml(&toml).unwrap();

        assert_eq!(original, loaded);
    }

    #[test]
    fn test_validate_rejects_bad_listen_addr() {
        let mut config = Config::default();
        config.server.listen_addr = "localhost".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidListenAddr("localhost".to_string()))
        );
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let mut config = Config::default();
        config.server.max_connections = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidMaxConnections(0))
        );

        let mut config = Config::default();
        config.storage.max_open_handles = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidMaxOpenHandles(0))
        );

        let mut config = Config::default();
        config.server.max_inflight_requests = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxInflight(0)));
    }

    #[test]
    fn test_validate_rejects_oversized_read_len() {
        let mut config = Config::default();
        config.storage.max_read_len = MAX_READ_LEN + 1;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidMaxReadLen(MAX_READ_LEN + 1))
        );
    }

    #[test]
    fn test_validate_rejects_unknown_log_level() {
        let mut config = Config::default();
        config.logging.level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }

    #[test]
    fn test_effective_level_downgrades_debug_in_production() {
        let mut logging = LoggingConfig {
            level: "debug".to_string(),
            ..Default::default()
        };
        assert_eq!(logging.effective_level(false), "info");
        assert_eq!(logging.effective_level(true), "debug");

        logging.allow_debug_in_production = true;
        assert_eq!(logging.effective_level(false), "debug");

        logging.level = "WARN".to_string();
        assert_eq!(logging.effective_level(false), "warn");
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/path/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let mut original = Config::default();
        original.server.max_connections = 7;
        original.save(&config_path).unwrap();

        let loaded = Config::load(&config_path).unwrap();
        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, "invalid [ toml").unwrap();

        let err = Config::load(&config_path).unwrap_err().to_string();
        assert!(err.contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.to_string_lossy().contains("depot"));
        assert!(path.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("DEPOT_LISTEN_ADDR", "127.0.0.1:9999");
        std::env::set_var("DEPOT_STORAGE_ROOT", "/tmp/depot-env-root");
        std::env::set_var("DEPOT_LOG_LEVEL", "warn");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.server.listen_addr, "127.0.0.1:9999");
        assert_eq!(config.storage.root, PathBuf::from("/tmp/depot-env-root"));
        assert_eq!(config.logging.level, "warn");

        std::env::remove_var("DEPOT_LISTEN_ADDR");
        std::env::remove_var("DEPOT_STORAGE_ROOT");
        std::env::remove_var("DEPOT_LOG_LEVEL");
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        std::env::set_var("DEPOT_DATABASE_PATH", "");

        let mut config = Config::default();
        let original = config.directory.database_path.clone();
        config.apply_env_overrides();
        assert_eq!(config.directory.database_path, original);

        std::env::remove_var("DEPOT_DATABASE_PATH");
    }

    #[test]
    #[serial]
    fn test_dev_environment_detection() {
        std::env::set_var("DEPOT_ENV", "dev");
        assert!(is_dev_environment());
        std::env::set_var("DEPOT_ENV", "production");
        assert!(!is_dev_environment());
        std::env::remove_var("DEPOT_ENV");
        assert!(!is_dev_environment());
    }
}
