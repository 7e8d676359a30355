//! Configuration for the queue runtime and the webhook layer.
//!
//! Both structs can be built programmatically (`Default` plus struct update
//! syntax) or loaded from the environment via [`MqConfig::from_env`], which
//! reads `LEANMQ_*` variables with `.env` file support.

use config::{Config, ConfigError, Environment};
use serde::Deserialize;
use std::time::Duration;

/// Connection and retry settings for the Redis-Streams backend.
#[derive(Debug, Clone, Deserialize)]
pub struct MqConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub db: i64,
    #[serde(default)]
    pub password: Option<String>,
    /// Prefix prepended to every backend key. Default empty.
    #[serde(default)]
    pub prefix: String,
    /// Seconds to wait when establishing a connection.
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,
    /// Retry attempts for transient backend failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Initial retry delay; grows exponentially with jitter.
    #[serde(default = "default_retry_interval")]
    pub retry_interval_ms: u64,
    /// Idle threshold after which pending entries become claimable by any
    /// consumer.
    #[serde(default = "default_reclaim_idle")]
    pub reclaim_idle_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    6379
}

fn default_connection_timeout() -> u64 {
    5
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_interval() -> u64 {
    1000
}

fn default_reclaim_idle() -> u64 {
    30
}

impl Default for MqConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            db: 0,
            password: None,
            prefix: String::new(),
            connection_timeout_secs: default_connection_timeout(),
            max_retries: default_max_retries(),
            retry_interval_ms: default_retry_interval(),
            reclaim_idle_secs: default_reclaim_idle(),
        }
    }
}

impl MqConfig {
    /// Load configuration from `LEANMQ_*` environment variables.
    ///
    /// A `.env` file in the working directory is honored if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        Config::builder()
            .add_source(Environment::with_prefix("LEANMQ").try_parsing(true))
            .build()?
            .try_deserialize()
    }

    /// Redis connection URL built from the host/port/db/password fields.
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => {
                format!("redis://:{}@{}:{}/{}", password, self.host, self.port, self.db)
            }
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn reclaim_idle(&self) -> Duration {
        Duration::from_secs(self.reclaim_idle_secs)
    }
}

/// Settings for the webhook façade and its background service.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    /// Prefix for webhook queue keys.
    #[serde(default = "default_webhook_prefix")]
    pub prefix: String,
    /// Dispatcher inter-iteration delay in seconds.
    #[serde(default = "default_process_interval")]
    pub process_interval_secs: u64,
    /// Whether the dispatcher service starts at construction time.
    #[serde(default)]
    pub auto_start: bool,
    /// Maximum messages claimed per route per iteration.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Blocking-read window for the first route of each iteration. Keep
    /// small so `stop()` stays responsive.
    #[serde(default = "default_block_secs")]
    pub block_secs: u64,
    /// Whether the supervisor installs SIGINT/SIGTERM handlers.
    #[serde(default = "default_install_signals")]
    pub install_signals: bool,
    /// Seconds `stop()` waits for the worker to exit cleanly.
    #[serde(default = "default_worker_thread_timeout")]
    pub worker_thread_timeout_secs: u64,
}

fn default_webhook_prefix() -> String {
    "webhook:".to_string()
}

fn default_process_interval() -> u64 {
    1
}

fn default_batch_size() -> usize {
    10
}

fn default_block_secs() -> u64 {
    1
}

fn default_install_signals() -> bool {
    true
}

fn default_worker_thread_timeout() -> u64 {
    5
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            prefix: default_webhook_prefix(),
            process_interval_secs: default_process_interval(),
            auto_start: false,
            batch_size: default_batch_size(),
            block_secs: default_block_secs(),
            install_signals: default_install_signals(),
            worker_thread_timeout_secs: default_worker_thread_timeout(),
        }
    }
}

impl WebhookConfig {
    pub fn process_interval(&self) -> Duration {
        Duration::from_secs(self.process_interval_secs)
    }

    pub fn worker_thread_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_thread_timeout_secs)
    }
}
