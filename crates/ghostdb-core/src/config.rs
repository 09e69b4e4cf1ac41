//! `GhostDB` Configuration Module
//!
//! Provides configuration file support via `ghostdb.toml`, environment variables,
//! and runtime overrides.
//!
//! # Priority (highest to lowest)
//!
//! 1. Runtime overrides (API, CLI flags)
//! 2. Environment variables (`GHOSTDB_<SECTION>__<KEY>`)
//! 3. Configuration file (`ghostdb.toml`)
//! 4. Default values

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to parse configuration file.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Invalid configuration value.
    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue {
        /// Configuration key that failed validation.
        key: String,
        /// Validation error message.
        message: String,
    },

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Object cache configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Number of active objects a shrink pass aims for.
    pub target_size: usize,
    /// Objects idle this long are ghostified even below `target_size`.
    pub inactive_seconds: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            target_size: 400,
            inactive_seconds: 3600,
        }
    }
}

/// Storage configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Data directory path.
    pub data_dir: String,
    /// Transaction log file name inside `data_dir`.
    pub log_file: String,
    /// Call `fsync` after every committed transaction.
    pub sync_on_commit: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "./ghostdb_data".to_string(),
            log_file: "data.glog".to_string(),
            sync_on_commit: true,
        }
    }
}

impl StorageConfig {
    /// Full path of the transaction log.
    #[must_use]
    pub fn log_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join(&self.log_file)
    }
}

/// Conflict resolution configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictConfig {
    /// Budget for loading the old and committed states (0 = unbounded).
    pub load_timeout_ms: u64,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            load_timeout_ms: 5000,
        }
    }
}

impl ConflictConfig {
    /// Returns the load budget, `None` when unbounded.
    #[must_use]
    pub fn load_timeout(&self) -> Option<Duration> {
        (self.load_timeout_ms > 0).then(|| Duration::from_millis(self.load_timeout_ms))
    }
}

/// Logging configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: error, warn, info, debug, trace.
    pub level: String,
    /// Log format: text or json.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

/// Main `GhostDB` configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GhostConfig {
    /// Object cache configuration.
    pub cache: CacheConfig,
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Conflict resolution configuration.
    pub conflict: ConflictConfig,
    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// Levels accepted by `logging.level`.
const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

/// Formats accepted by `logging.format`.
const LOG_FORMATS: [&str; 2] = ["text", "json"];

/// Environment prefix; `GHOSTDB_CACHE__TARGET_SIZE` sets `cache.target_size`.
const ENV_PREFIX: &str = "GHOSTDB_";

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

fn check_one_of(key: &str, value: &str, allowed: &[&str]) -> Result<(), ConfigError> {
    if allowed.contains(&value) {
        Ok(())
    } else {
        Err(invalid(key, format!("'{value}' is not one of {allowed:?}")))
    }
}

impl GhostConfig {
    /// Loads `ghostdb.toml` from the working directory, then the environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ParseError`] if a source cannot be parsed.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("ghostdb.toml")
    }

    /// Layers defaults, the TOML file at `path` and `GHOSTDB_*` variables.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ParseError`] if a source cannot be parsed.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::extract(
            Self::base()
                .merge(Toml::file(path.as_ref()))
                .merge(Env::prefixed(ENV_PREFIX).split("__").lowercase(true)),
        )
    }

    /// Defaults overlaid with a TOML document; the environment is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ParseError`] on malformed TOML or mistyped keys.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        Self::extract(Self::base().merge(Toml::string(toml_str)))
    }

    fn base() -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        figment
            .extract()
            .map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Range-checks every section.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] naming the first offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let day = crate::clock::SECONDS_PER_DAY;
        if self.cache.target_size == 0 {
            return Err(invalid("cache.target_size", "value must be >= 1"));
        }
        if !(1..=day).contains(&self.cache.inactive_seconds) {
            return Err(invalid(
                "cache.inactive_seconds",
                format!("{} is outside 1..={day}", self.cache.inactive_seconds),
            ));
        }
        if self.storage.log_file.is_empty() {
            return Err(invalid("storage.log_file", "value must not be empty"));
        }
        check_one_of("logging.level", &self.logging.level, &LOG_LEVELS)?;
        check_one_of("logging.format", &self.logging.format, &LOG_FORMATS)
    }

    /// Renders the configuration as pretty TOML.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ParseError`] if a value has no TOML form.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}
