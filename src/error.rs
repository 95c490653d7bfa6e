//! Error types for a3s-pubsub

use std::path::Path;
use thiserror::Error;

/// Errors that can occur in the pub/sub system
#[derive(Debug, Error)]
pub enum EventError {
    /// Topic is empty or wildcarded at both ends
    #[error("Invalid topic '{0}': expected a non-empty topic wildcarded at most at one end")]
    InvalidTopic(String),

    /// Subscription id is empty or not usable as a file name
    #[error("Invalid subscription id '{0}'")]
    InvalidSubscription(String),

    /// Message could not be encoded for the durable log
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Log or index file I/O failure
    #[error("Log I/O error on '{path}': {source}")]
    LogIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Subscription not found
    #[error("Subscription not found: {0}")]
    NotFound(String),

    /// Subscription already exists and reuse was not allowed
    #[error("Subscription already exists: {0}")]
    AlreadyExists(String),

    /// A consumer is already attached to the subscription
    #[error("Subscription is already delivering: {0}")]
    AlreadyDelivering(String),

    /// A listener did not acknowledge a delivered message
    #[error("Failed to acknowledge message: {0}")]
    Ack(String),

    /// Consumer handler rejected a batch
    #[error("Handler error: {0}")]
    Handler(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl EventError {
    /// Wrap an I/O error with the path it happened on
    pub fn log_io(path: &Path, source: std::io::Error) -> Self {
        EventError::LogIo {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Result type alias for pub/sub operations
pub type Result<T> = std::result::Result<T, EventError>;
