//! Error types for queue operations.
//!
//! The taxonomy separates transient connection failures (retried by the
//! gateway) from logic failures (surfaced immediately to the caller).

use thiserror::Error;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum MqError {
    /// Backend unreachable after the gateway exhausted its retries.
    #[error("connection failure after {attempts} attempts: {source}")]
    Connection {
        attempts: u32,
        #[source]
        source: redis::RedisError,
    },

    /// Generic operation failure against a specific queue.
    #[error("queue operation failed on '{queue}': {reason}")]
    Queue { queue: String, reason: String },

    /// The named queue does not exist.
    #[error("queue not found: {0}")]
    QueueNotFound(String),

    /// The dead letter queue sibling does not exist.
    #[error("dead letter queue not found for: {0}")]
    DlqNotFound(String),

    /// Malformed or mishandled payload.
    #[error("message error: {0}")]
    Message(String),

    /// JSON serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// The atomic batch failed to commit.
    #[error("transaction failed: {0}")]
    Transaction(String),

    /// Non-transient backend error, surfaced unretried.
    #[error("backend error: {0}")]
    Backend(#[from] redis::RedisError),

    /// Operation after `close()`.
    #[error("connection already closed")]
    Closed,
}

impl MqError {
    /// Whether this error is transient in character (worth retrying).
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::Backend(e) => is_transient_redis_error(e),
            _ => false,
        }
    }
}

/// Classify a Redis error as transient (connection-level) or logic-level.
///
/// A BLOCK timeout on `XREADGROUP` is handled at the call site and never
/// reaches this check.
pub(crate) fn is_transient_redis_error(e: &redis::RedisError) -> bool {
    e.is_connection_dropped() || e.is_io_error() || e.is_timeout() || e.is_connection_refusal()
}

pub type Result<T> = std::result::Result<T, MqError>;
