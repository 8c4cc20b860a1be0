use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub redis: RedisConfig,
    pub stream: StreamConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Connection URL. Empty selects the single-node local transport.
    pub url: String,
    pub connect_timeout_seconds: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            connect_timeout_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Namespace for every key and channel. `:rs` is appended internally.
    pub key_prefix: String,
    /// How long a resumer waits for the producer's first reply
    pub ack_timeout_ms: u64,
    /// Expiry of the done sentinel and the control state
    pub done_ttl_seconds: u64,
    /// Attach a cancellation controller to every producer
    pub cancellation_enabled: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            key_prefix: "resumable-stream".to_string(),
            ack_timeout_ms: 1000,
            done_ttl_seconds: 24 * 60 * 60,
            cancellation_enabled: true,
        }
    }
}

impl StreamConfig {
    #[must_use]
    pub const fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    #[must_use]
    pub const fn done_ttl(&self) -> Duration {
        Duration::from_secs(self.done_ttl_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file
    /// 3. Default values
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // RESUMABLE_STREAM_REDIS__URL, RESUMABLE_STREAM_STREAM__KEY_PREFIX, ...
        builder = builder.add_source(
            Environment::with_prefix("RESUMABLE_STREAM")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: Self = builder.build()?.try_deserialize()?;
        if config.redis.url.is_empty() {
            if let Some(url) = redis_url_from_env() {
                config.redis.url = url;
            }
        }
        Ok(config)
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    #[must_use]
    pub fn redis_url(&self) -> Option<&str> {
        if self.redis.url.is_empty() {
            None
        } else {
            Some(&self.redis.url)
        }
    }

    /// Collect every configuration problem instead of stopping at the first
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.stream.key_prefix.trim().is_empty() {
            errors.push("stream.key_prefix must not be empty".to_string());
        }
        if self.stream.ack_timeout_ms == 0 {
            errors.push("stream.ack_timeout_ms must be greater than zero".to_string());
        }
        if self.stream.done_ttl_seconds == 0 {
            errors.push("stream.done_ttl_seconds must be greater than zero".to_string());
        }
        if let Some(url) = self.redis_url() {
            if !(url.starts_with("redis://") || url.starts_with("rediss://")) {
                errors.push(format!("redis.url has an unsupported scheme: {url}"));
            }
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got \"{}\"",
                self.logging.format
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// `REDIS_URL` takes precedence over `KV_URL`
fn redis_url_from_env() -> Option<String> {
    ["REDIS_URL", "KV_URL"]
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .find(|url| !url.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.stream.key_prefix, "resumable-stream");
        assert_eq!(config.stream.ack_timeout(), Duration::from_secs(1));
        assert_eq!(config.stream.done_ttl(), Duration::from_secs(86_400));
        assert!(config.stream.cancellation_enabled);
        assert!(config.redis_url().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = Config::default();
        config.stream.key_prefix = " ".to_string();
        config.stream.ack_timeout_ms = 0;
        config.redis.url = "http://localhost:6379".to_string();
        config.logging.format = "xml".to_string();

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors.iter().any(|e| e.contains("key_prefix")));
        assert!(errors.iter().any(|e| e.contains("unsupported scheme")));
    }

    #[test]
    fn test_redis_url_accessor() {
        let mut config = Config::default();
        config.redis.url = "redis://127.0.0.1:6379".to_string();
        assert_eq!(config.redis_url(), Some("redis://127.0.0.1:6379"));
        assert!(config.validate().is_ok());
    }
}
