//! The queue service façade.
//!
//! `LeanMq` owns the backend gateway and the registry, and is the single
//! entry point for queue lifecycle, transactions and the expiration sweep.
//! It is cheap to clone; `close()` is the explicit, idempotent resource
//! release (pair construction with a scope guard where guaranteed release
//! matters).

use std::sync::Arc;

use crate::config::MqConfig;
use crate::error::Result;
use crate::queue::{ExpirationSweeper, Queue, QueueInfo, QueueRegistry, Transaction};
use crate::redis::{RedisHealth, RedisPool};

/// Reliable message queue over a Redis-Streams-compatible backend.
#[derive(Clone)]
pub struct LeanMq {
    pool: Arc<RedisPool>,
    registry: QueueRegistry,
    sweeper: Arc<ExpirationSweeper>,
}

impl LeanMq {
    /// Create a service from explicit configuration. No connection is made
    /// until first use.
    pub fn new(config: MqConfig) -> Result<Self> {
        let prefix = config.prefix.clone();
        let pool = Arc::new(RedisPool::new(config)?);
        let registry = QueueRegistry::new(pool.clone(), &prefix);
        let sweeper = Arc::new(ExpirationSweeper::new(
            pool.clone(),
            registry.clone(),
            &prefix,
        ));

        Ok(Self {
            pool,
            registry,
            sweeper,
        })
    }

    /// Create a service from `LEANMQ_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::new(MqConfig::from_env()?)
    }

    /// Verify backend liveness.
    pub async fn ping(&self) -> Result<()> {
        self.pool.ping().await
    }

    /// Gateway health tracker, for embedding in health endpoints.
    pub fn health(&self) -> Arc<RedisHealth> {
        self.pool.health()
    }

    /// Create `name` and its DLQ sibling. Idempotent.
    pub async fn create_queue_pair(&self, name: &str) -> Result<(Queue, Queue)> {
        self.registry.create_pair(name).await
    }

    /// Handle to a registered queue, or `None` when unknown.
    pub async fn get_queue(&self, name: &str) -> Result<Option<Queue>> {
        self.registry.get(name).await
    }

    /// Handle to the DLQ paired with `name`, or `None` when unknown.
    pub async fn get_dead_letter_queue(&self, name: &str) -> Result<Option<Queue>> {
        self.registry.get_dlq(name).await
    }

    /// Snapshot of every registered queue with live counts.
    pub async fn list_queues(&self) -> Result<Vec<QueueInfo>> {
        self.registry.list().await
    }

    /// Unregister `name` and remove its stream; with `also_dlq` the sibling
    /// goes too.
    pub async fn delete_queue(&self, name: &str, also_dlq: bool) -> Result<()> {
        self.registry.delete(name, also_dlq).await
    }

    /// Remove expired messages across all registered queues. Returns the
    /// total removed.
    pub async fn sweep_expired(&self) -> Result<u64> {
        self.sweeper.sweep_expired().await
    }

    /// Start an atomic multi-publish transaction.
    pub fn transaction(&self) -> Transaction {
        Transaction::new(self.pool.clone())
    }

    /// Release backend resources. Idempotent; any later use of this service
    /// (or its queue handles) fails with `MqError::Closed`.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MqError;

    #[test]
    fn test_service_creation_makes_no_connection() {
        let mq = LeanMq::new(MqConfig::default()).unwrap();
        assert!(!mq.health().is_healthy());
    }

    #[tokio::test]
    async fn test_operations_after_close_fail() {
        let mq = LeanMq::new(MqConfig::default()).unwrap();
        mq.close().await;

        assert!(matches!(mq.ping().await, Err(MqError::Closed)));
        assert!(matches!(
            mq.create_queue_pair("orders").await,
            Err(MqError::Closed)
        ));
        assert!(matches!(mq.list_queues().await, Err(MqError::Closed)));
    }
}
