//! Configuration for the router and the durable subscription layer

use crate::backoff::BackoffPolicy;
use crate::error::{EventError, Result};
use crate::types::OpenOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default topic component separator
pub const DEFAULT_SEPARATOR: &str = ".";

/// Wildcard marker for prefix (`foo.*`) and suffix (`*.foo`) listeners
pub const WILDCARD: char = '*';

/// Pub/sub configuration
///
/// Every field has a default, so an empty JSON object is a valid config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PubSubConfig {
    /// Topic component separator
    #[serde(default = "default_separator")]
    pub separator: String,

    /// Directory holding subscription logs and `index.json`
    #[serde(default = "default_subscription_dir")]
    pub subscription_dir: PathBuf,

    /// Deliver a batch once it reaches this many bytes
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: usize,

    /// Deliver a batch this long after its first line arrived
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,

    /// Handler retry backoff
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Handler retry backoff, in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default = "default_retry_first_ms")]
    pub first_ms: u64,
    #[serde(default = "default_retry_step_ms")]
    pub step_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub max_ms: u64,
}

fn default_separator() -> String {
    DEFAULT_SEPARATOR.to_string()
}

fn default_subscription_dir() -> PathBuf {
    PathBuf::from("subscriptions")
}

fn default_max_batch_bytes() -> usize {
    2 * 1024 * 1024
}

fn default_batch_timeout_ms() -> u64 {
    5
}

fn default_retry_first_ms() -> u64 {
    100
}

fn default_retry_step_ms() -> u64 {
    100
}

fn default_retry_max_ms() -> u64 {
    5000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            first_ms: default_retry_first_ms(),
            step_ms: default_retry_step_ms(),
            max_ms: default_retry_max_ms(),
        }
    }
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            separator: default_separator(),
            subscription_dir: default_subscription_dir(),
            max_batch_bytes: default_max_batch_bytes(),
            batch_timeout_ms: default_batch_timeout_ms(),
            retry: RetryConfig::default(),
        }
    }
}

impl PubSubConfig {
    /// Read and validate a JSON config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            EventError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&json).map_err(|e| {
            EventError::Config(format!("Failed to parse config file {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the router or deliverer cannot use
    pub fn validate(&self) -> Result<()> {
        validate_separator(&self.separator)?;
        if self.max_batch_bytes == 0 {
            return Err(EventError::Config(
                "maxBatchBytes must be greater than zero".to_string(),
            ));
        }
        if self.retry.first_ms > self.retry.max_ms {
            return Err(EventError::Config(format!(
                "retry.firstMs ({}) exceeds retry.maxMs ({})",
                self.retry.first_ms, self.retry.max_ms
            )));
        }
        Ok(())
    }

    /// Runtime delivery settings derived from this config
    pub fn delivery(&self) -> DeliveryConfig {
        DeliveryConfig {
            max_batch_bytes: self.max_batch_bytes,
            batch_timeout: Duration::from_millis(self.batch_timeout_ms),
            backoff: BackoffPolicy {
                first: Duration::from_millis(self.retry.first_ms),
                step: Duration::from_millis(self.retry.step_ms),
                max: Duration::from_millis(self.retry.max_ms),
            },
        }
    }
}

pub(crate) fn validate_separator(separator: &str) -> Result<()> {
    if separator.is_empty() {
        return Err(EventError::Config("separator cannot be empty".to_string()));
    }
    if separator.contains(WILDCARD) {
        return Err(EventError::Config(format!(
            "separator '{}' cannot contain the wildcard '{}'",
            separator, WILDCARD
        )));
    }
    Ok(())
}

/// Batching and retry settings for one deliverer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryConfig {
    pub max_batch_bytes: usize,
    pub batch_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        PubSubConfig::default().delivery()
    }
}

impl DeliveryConfig {
    /// Apply per-subscription overrides from `OpenOptions`
    pub fn with_overrides(mut self, opts: &OpenOptions) -> Self {
        if let Some(max) = opts.max_batch_bytes {
            self.max_batch_bytes = max.max(1);
        }
        if let Some(ms) = opts.batch_timeout_ms {
            self.batch_timeout = Duration::from_millis(ms);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PubSubConfig::default();
        assert_eq!(config.separator, ".");
        assert_eq!(config.max_batch_bytes, 2 * 1024 * 1024);
        assert_eq!(config.batch_timeout_ms, 5);
        assert!(config.validate().is_ok());

        let delivery = config.delivery();
        assert_eq!(delivery.batch_timeout, Duration::from_millis(5));
        assert_eq!(delivery.backoff, BackoffPolicy::default());
    }

    #[test]
    fn test_empty_json_uses_defaults() {
        let config: PubSubConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.separator, ".");
        assert_eq!(config.retry.max_ms, 5000);
        assert_eq!(config.subscription_dir, PathBuf::from("subscriptions"));
    }

    #[test]
    fn test_camel_case_fields() {
        let config: PubSubConfig = serde_json::from_str(
            r#"{"separator": "/", "maxBatchBytes": 1024, "batchTimeoutMs": 20, "retry": {"maxMs": 1000}}"#,
        )
        .unwrap();
        assert_eq!(config.separator, "/");
        assert_eq!(config.max_batch_bytes, 1024);
        assert_eq!(config.batch_timeout_ms, 20);
        assert_eq!(config.retry.first_ms, 100);
        assert_eq!(config.retry.max_ms, 1000);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = PubSubConfig {
            separator: String::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.separator = "*".to_string();
        assert!(config.validate().is_err());

        config.separator = ".".to_string();
        config.max_batch_bytes = 0;
        assert!(config.validate().is_err());

        config.max_batch_bytes = 10;
        config.retry.first_ms = 6000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides() {
        let opts = OpenOptions {
            max_batch_bytes: Some(64),
            batch_timeout_ms: Some(50),
            ..Default::default()
        };
        let delivery = DeliveryConfig::default().with_overrides(&opts);
        assert_eq!(delivery.max_batch_bytes, 64);
        assert_eq!(delivery.batch_timeout, Duration::from_millis(50));
    }

    #[test]
    fn test_from_file() {
        let dir = std::env::temp_dir().join(format!("a3s-pubsub-cfg-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("pubsub.json");

        std::fs::write(&path, r#"{"batchTimeoutMs": 10}"#).unwrap();
        let config = PubSubConfig::from_file(&path).unwrap();
        assert_eq!(config.batch_timeout_ms, 10);

        std::fs::write(&path, r#"{"separator": ""}"#).unwrap();
        assert!(PubSubConfig::from_file(&path).is_err());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
