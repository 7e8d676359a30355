//! Backend gateway for the Redis-Streams-compatible server.
//!
//! # Modules
//!
//! - `pool`: the single connection abstraction all higher components share
//! - `ExponentialBackoff`: retry delays for transient failures
//! - `RedisHealth`: tracks gateway connection health

mod backoff;
mod health;
pub mod pool;

pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use health::{RedisHealth, RedisHealthStats, RedisHealthStatus};
pub use pool::RedisPool;

/// Get current time in milliseconds since epoch
pub(crate) fn current_time_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
