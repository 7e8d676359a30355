//! Backend connection gateway.
//!
//! A single multiplexed connection shared by every higher component, with
//! transparent retry for transient failures. Blocking stream reads get a
//! dedicated connection so they never stall the shared pipeline.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use redis::aio::MultiplexedConnection;
use redis::{Client, Cmd, FromRedisValue, Pipeline, RedisError, RedisResult};
use tokio::sync::RwLock;
use tokio::time::timeout;

use crate::config::MqConfig;
use crate::error::{is_transient_redis_error, MqError, Result};

use super::{ExponentialBackoff, RedisHealth};

/// Gateway to the Redis-Streams backend.
///
/// Cheap to share behind an `Arc`; all of the queue runtime funnels its
/// backend access through here. Transient failures (dropped connection, IO
/// error, timeout) are retried with exponential backoff up to
/// `max_retries`; logic errors surface immediately.
pub struct RedisPool {
    /// Client for creating connections
    client: Client,

    /// Multiplexed connection (shared across tasks)
    connection: RwLock<Option<MultiplexedConnection>>,

    /// Set by `close()`; all further use fails with `MqError::Closed`
    closed: AtomicBool,

    /// Health tracker
    health: Arc<RedisHealth>,

    /// Configuration
    config: MqConfig,
}

impl RedisPool {
    /// Create a new gateway. No connection is made until first use.
    pub fn new(config: MqConfig) -> Result<Self> {
        let client = Client::open(config.url())?;

        Ok(Self {
            client,
            connection: RwLock::new(None),
            closed: AtomicBool::new(false),
            health: Arc::new(RedisHealth::new()),
            config,
        })
    }

    pub fn health(&self) -> Arc<RedisHealth> {
        self.health.clone()
    }

    pub fn config(&self) -> &MqConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(MqError::Closed);
        }
        Ok(())
    }

    /// Get the shared connection, establishing it if necessary.
    async fn get_connection(&self) -> RedisResult<MultiplexedConnection> {
        {
            let conn = self.connection.read().await;
            if let Some(ref c) = *conn {
                return Ok(c.clone());
            }
        }

        self.connect().await
    }

    /// Establish the shared connection.
    async fn connect(&self) -> RedisResult<MultiplexedConnection> {
        let mut conn_guard = self.connection.write().await;

        // Double-check in case another task connected while we waited
        if let Some(ref c) = *conn_guard {
            return Ok(c.clone());
        }

        self.health.set_reconnecting();

        match timeout(
            self.config.connection_timeout(),
            self.client.get_multiplexed_tokio_connection(),
        )
        .await
        {
            Ok(Ok(conn)) => {
                *conn_guard = Some(conn.clone());
                self.health.set_connected();
                tracing::info!("backend connection established");
                Ok(conn)
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "failed to connect to backend");
                Err(e)
            }
            Err(_) => {
                tracing::error!(
                    timeout_secs = self.config.connection_timeout_secs,
                    "connection attempt timed out"
                );
                Err(RedisError::from((
                    redis::ErrorKind::IoError,
                    "connection attempt timed out",
                )))
            }
        }
    }

    /// Drop the cached connection so the next call reconnects.
    async fn invalidate(&self) {
        let mut conn_guard = self.connection.write().await;
        *conn_guard = None;
    }

    /// Execute a backend call with retry for transient failures.
    ///
    /// The closure is invoked once per attempt with a fresh handle on the
    /// shared connection. Transient errors invalidate the cached connection
    /// and back off exponentially; after `max_retries` retries the failure
    /// surfaces as `MqError::Connection`. Logic errors are never retried.
    pub async fn execute<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: Fn(MultiplexedConnection) -> Fut,
        Fut: Future<Output = RedisResult<T>>,
    {
        self.ensure_open()?;

        let mut backoff = ExponentialBackoff::with_initial_delay(self.config.retry_interval());
        let mut attempt: u32 = 0;

        loop {
            let outcome = match self.get_connection().await {
                Ok(conn) => f(conn).await,
                Err(e) => Err(e),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if is_transient_redis_error(&e) => {
                    self.invalidate().await;
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        self.health.set_reconnecting();
                        return Err(MqError::Connection {
                            attempts: attempt,
                            source: e,
                        });
                    }
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        attempt,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient backend failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(MqError::Backend(e)),
            }
        }
    }

    /// Run a single prepared command through the retry wrapper.
    pub async fn query<T: FromRedisValue>(&self, cmd: &Cmd) -> Result<T> {
        self.execute(|mut conn| async move { cmd.query_async(&mut conn).await })
            .await
    }

    /// Run a prepared pipeline through the retry wrapper.
    ///
    /// With `pipe.atomic()` the batch executes under MULTI/EXEC and is
    /// all-or-nothing on the backend.
    pub async fn query_pipeline<T: FromRedisValue>(&self, pipe: &Pipeline) -> Result<T> {
        self.execute(|mut conn| async move { pipe.query_async(&mut conn).await })
            .await
    }

    /// Verify backend liveness.
    pub async fn ping(&self) -> Result<()> {
        let _: String = self.query(&redis::cmd("PING")).await?;
        Ok(())
    }

    /// Hand out a dedicated connection for blocking stream reads.
    ///
    /// A blocked `XREADGROUP` occupies its server-side connection, so it
    /// must not share the multiplexed pipeline with regular commands.
    pub async fn blocking_connection(&self) -> Result<MultiplexedConnection> {
        self.ensure_open()?;

        let mut backoff = ExponentialBackoff::with_initial_delay(self.config.retry_interval());
        let mut attempt: u32 = 0;

        loop {
            match timeout(
                self.config.connection_timeout(),
                self.client.get_multiplexed_tokio_connection(),
            )
            .await
            {
                Ok(Ok(conn)) => return Ok(conn),
                Ok(Err(e)) if !is_transient_redis_error(&e) => return Err(MqError::Backend(e)),
                Ok(Err(e)) => {
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        return Err(MqError::Connection {
                            attempts: attempt,
                            source: e,
                        });
                    }
                    tokio::time::sleep(backoff.next_delay()).await;
                }
                Err(_) => {
                    let e = RedisError::from((
                        redis::ErrorKind::IoError,
                        "connection attempt timed out",
                    ));
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        return Err(MqError::Connection {
                            attempts: attempt,
                            source: e,
                        });
                    }
                    tokio::time::sleep(backoff.next_delay()).await;
                }
            }
        }
    }

    /// Release gateway resources. Idempotent; any later use fails with
    /// `MqError::Closed`.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut conn_guard = self.connection.write().await;
        *conn_guard = None;
        self.health.set_closed();
        tracing::info!("backend gateway closed");
    }
}
