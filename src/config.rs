//! Configuration module for the log shipper.
//!
//! Configuration is read from a YAML file, then a few settings can be
//! overridden through environment variables:
//! - `LOG_SHIPPER_WEBHOOK_URL`: collector endpoint
//! - `LOG_SHIPPER_WEBHOOK_SECRET`: signing secret
//! - `LOG_SHIPPER_API_KEY`: static API key sent as `X-API-Key`
//! - `LOG_SHIPPER_BATCH_SIZE`: entries per batch
//!
//! The pipeline itself only ever sees a loaded, validated [`Config`].

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::entry::Fields;

/// Default source identifier sent as `X-Source` and in the payload
const DEFAULT_SOURCE_NAME: &str = "log-shipper";

/// Default batch size (number of logs per batch)
const DEFAULT_BATCH_SIZE: usize = 100;

/// Default time threshold for flushing a partial batch, in seconds
const DEFAULT_BATCH_TIMEOUT_SECS: u64 = 30;

/// Default number of send attempts per batch
const DEFAULT_RETRY_COUNT: u32 = 3;

/// Default pause between send attempts, in seconds
const DEFAULT_RETRY_DELAY_SECS: u64 = 5;

/// Default per-attempt HTTP timeout, in seconds
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Default bound on the shutdown drain, in seconds
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Maximum allowed batch size to prevent memory issues
const MAX_BATCH_SIZE: usize = 10_000;

/// Maximum batch timeout to ensure reasonable data freshness
const MAX_BATCH_TIMEOUT_SECS: u64 = 3_600;

/// Error type for configuration loading failures
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid value for {field}: {message}")]
    Invalid { field: String, message: String },
}

impl ConfigError {
    fn invalid(field: &str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// One configured log source, as written in the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Path of the file to follow
    pub path: PathBuf,

    /// Logical name; defaults to the file stem
    #[serde(default)]
    pub name: Option<String>,

    /// Host override; defaults to the local hostname
    #[serde(default)]
    pub host: Option<String>,

    /// Static tags attached to every entry from this source
    #[serde(default)]
    pub fields: Fields,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl SourceConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            name: None,
            host: None,
            fields: Fields::new(),
            enabled: true,
        }
    }

    /// Fill in the derived name and host.
    pub fn resolve(&self, default_host: &str) -> SourceDescriptor {
        let name = self.name.clone().unwrap_or_else(|| {
            self.path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.path.display().to_string())
        });

        SourceDescriptor {
            path: self.path.clone(),
            name,
            host: self.host.clone().unwrap_or_else(|| default_host.to_string()),
            fields: self.fields.clone(),
        }
    }
}

/// A source with every optional setting resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDescriptor {
    pub path: PathBuf,
    pub name: String,
    pub host: String,
    pub fields: Fields,
}

/// Configuration for the log shipper.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Files to follow
    pub log_sources: Vec<SourceConfig>,

    /// Collector endpoint receiving signed batches
    pub webhook_url: String,

    /// Shared secret for the `X-Signature` HMAC
    pub webhook_secret: String,

    /// Optional static API key
    pub api_key: Option<String>,

    /// Pipeline identifier sent as `X-Source` and in the payload
    pub source_name: String,

    /// Number of entries that triggers a flush
    pub batch_size: usize,

    /// Age of a non-empty batch that triggers a flush
    #[serde(rename = "batch_timeout_seconds", with = "seconds")]
    pub batch_timeout: Duration,

    /// Total send attempts per batch
    pub retry_count: u32,

    /// Pause between send attempts
    #[serde(rename = "retry_delay_seconds", with = "seconds")]
    pub retry_delay: Duration,

    /// Per-attempt HTTP timeout
    #[serde(rename = "request_timeout_seconds", with = "seconds")]
    pub request_timeout: Duration,

    /// Bounded queue capacity in entries
    pub queue_capacity: usize,

    /// Upper bound on the shutdown drain
    #[serde(rename = "shutdown_timeout_seconds", with = "seconds")]
    pub shutdown_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_sources: Vec::new(),
            webhook_url: String::new(),
            webhook_secret: String::new(),
            api_key: None,
            source_name: DEFAULT_SOURCE_NAME.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            batch_timeout: Duration::from_secs(DEFAULT_BATCH_TIMEOUT_SECS),
            retry_count: DEFAULT_RETRY_COUNT,
            retry_delay: Duration::from_secs(DEFAULT_RETRY_DELAY_SECS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            queue_capacity: crate::queue::DEFAULT_QUEUE_CAPACITY,
            shutdown_timeout: Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
        }
    }
}

impl Config {
    /// Load, override from the environment and validate.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read or parsed, if an
    /// override is malformed, or if a value is out of range.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config = Self::from_yaml(&raw)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML document, filling defaults for missing keys.
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Apply `LOG_SHIPPER_*` environment overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(url) = env::var("LOG_SHIPPER_WEBHOOK_URL") {
            self.webhook_url = url;
        }
        if let Ok(secret) = env::var("LOG_SHIPPER_WEBHOOK_SECRET") {
            self.webhook_secret = secret;
        }
        if let Ok(key) = env::var("LOG_SHIPPER_API_KEY") {
            self.api_key = Some(key).filter(|k| !k.is_empty());
        }
        if let Ok(value) = env::var("LOG_SHIPPER_BATCH_SIZE") {
            self.batch_size = value.parse().map_err(|_| {
                ConfigError::invalid(
                    "LOG_SHIPPER_BATCH_SIZE",
                    format!("'{}' is not a valid number", value),
                )
            })?;
        }
        Ok(())
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.webhook_url.trim();
        if url.is_empty() {
            return Err(ConfigError::invalid("webhook_url", "must be set"));
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::invalid(
                "webhook_url",
                format!("'{}' is not an http(s) URL", url),
            ));
        }

        if self.batch_size == 0 {
            return Err(ConfigError::invalid("batch_size", "must be greater than 0"));
        }
        if self.batch_size > MAX_BATCH_SIZE {
            return Err(ConfigError::invalid(
                "batch_size",
                format!(
                    "{} exceeds maximum allowed ({})",
                    self.batch_size, MAX_BATCH_SIZE
                ),
            ));
        }

        if self.batch_timeout < Duration::from_secs(1) {
            return Err(ConfigError::invalid(
                "batch_timeout_seconds",
                "must be at least 1 second",
            ));
        }
        if self.batch_timeout > Duration::from_secs(MAX_BATCH_TIMEOUT_SECS) {
            return Err(ConfigError::invalid(
                "batch_timeout_seconds",
                format!("exceeds maximum ({}s)", MAX_BATCH_TIMEOUT_SECS),
            ));
        }

        if self.retry_count == 0 {
            return Err(ConfigError::invalid("retry_count", "must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::invalid("queue_capacity", "must be greater than 0"));
        }

        for (i, source) in self.log_sources.iter().enumerate() {
            if source.path.as_os_str().is_empty() {
                return Err(ConfigError::invalid(
                    &format!("log_sources[{}].path", i),
                    "must not be empty",
                ));
            }
        }

        Ok(())
    }

    /// Enabled sources with names and hosts resolved.
    pub fn enabled_sources(&self) -> Vec<SourceDescriptor> {
        let host = local_hostname();
        self.log_sources
            .iter()
            .filter(|s| s.enabled)
            .map(|s| s.resolve(&host))
            .collect()
    }
}

/// Hostname of this machine, or `localhost` if it cannot be determined.
pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

fn default_enabled() -> bool {
    true
}

/// Durations written as (possibly fractional) seconds.
mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom(format!(
                "{} is not a valid number of seconds",
                secs
            )));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}
