//! Atomic multi-publish transaction.
//!
//! A transaction is an in-memory builder: `send` only records a publish
//! intent, and `commit` submits the whole batch as one MULTI/EXEC pipeline
//! that the backend executes atomically. Dropping an uncommitted
//! transaction discards it without touching the backend.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

use crate::error::{MqError, Result};
use crate::redis::RedisPool;

use super::message;
use super::queue::Queue;

struct PublishIntent {
    queue: String,
    key: String,
    fields: Vec<(&'static str, String)>,
}

/// Builder for an atomic batch of publishes.
///
/// Reads cannot participate, and queue creation cannot be rolled back, so
/// queues must exist before the transaction. Atomicity is backend-scoped;
/// there is no cross-backend two-phase commit.
pub struct Transaction {
    pool: Arc<RedisPool>,
    intents: Vec<PublishIntent>,
    finished: bool,
}

impl Transaction {
    pub(crate) fn new(pool: Arc<RedisPool>) -> Self {
        Self {
            pool,
            intents: Vec::new(),
            finished: false,
        }
    }

    /// Queue a publish. Nothing reaches the backend until `commit`.
    ///
    /// `created_at` (and the TTL deadline) are captured now, at send time.
    pub fn send<T: Serialize>(
        &mut self,
        queue: &Queue,
        body: &T,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let value = serde_json::to_value(body)?;
        if !value.is_object() {
            return Err(MqError::Message(
                "message body must be a JSON object".to_string(),
            ));
        }

        let created_at = Utc::now();
        let expires_at =
            ttl.map(|t| created_at + chrono::Duration::milliseconds(t.as_millis() as i64));

        self.intents.push(PublishIntent {
            queue: queue.name().to_string(),
            key: queue.stream_key_name().to_string(),
            fields: message::encode_fields(&value, created_at, expires_at, 0),
        });
        Ok(())
    }

    /// Number of queued publishes.
    pub fn len(&self) -> usize {
        self.intents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }

    /// Commit the batch atomically. Either every publish becomes visible
    /// together, or none does and `MqError::Transaction` is returned.
    ///
    /// Returns the backend-assigned ids in send order.
    pub async fn commit(mut self) -> Result<Vec<String>> {
        self.finished = true;

        if self.intents.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for intent in &self.intents {
            pipe.cmd("XADD").arg(&intent.key).arg("*").arg(&intent.fields[..]);
        }

        let ids: Vec<String> = self
            .pool
            .query_pipeline(&pipe)
            .await
            .map_err(|e| match e {
                MqError::Closed => MqError::Closed,
                other => MqError::Transaction(other.to_string()),
            })?;

        tracing::debug!(publishes = ids.len(), "transaction committed");
        Ok(ids)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished && !self.intents.is_empty() {
            tracing::debug!(
                discarded = self.intents.len(),
                "transaction dropped without commit, discarding queued sends"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MqConfig;
    use serde_json::json;

    fn test_pool() -> Arc<RedisPool> {
        Arc::new(RedisPool::new(MqConfig::default()).unwrap())
    }

    #[test]
    fn test_send_accumulates_without_backend() {
        let pool = test_pool();
        let queue = Queue::new(pool.clone(), "", "q1");
        let other = Queue::new(pool.clone(), "", "q2");

        let mut tx = Transaction::new(pool);
        assert!(tx.is_empty());

        tx.send(&queue, &json!({"a": 1}), None).unwrap();
        tx.send(&other, &json!({"b": 2}), Some(Duration::from_secs(60)))
            .unwrap();
        assert_eq!(tx.len(), 2);
    }

    #[test]
    fn test_send_rejects_non_object_body() {
        let pool = test_pool();
        let queue = Queue::new(pool.clone(), "", "q1");

        let mut tx = Transaction::new(pool);
        let err = tx.send(&queue, &"scalar", None).unwrap_err();
        assert!(matches!(err, MqError::Message(_)));
        assert!(tx.is_empty());
    }

    #[tokio::test]
    async fn test_empty_commit_is_a_no_op() {
        let tx = Transaction::new(test_pool());
        let ids = tx.commit().await.unwrap();
        assert!(ids.is_empty());
    }

    #[tokio::test]
    async fn test_commit_after_close_fails() {
        let pool = test_pool();
        let queue = Queue::new(pool.clone(), "", "q1");

        let mut tx = Transaction::new(pool.clone());
        tx.send(&queue, &json!({"a": 1}), None).unwrap();

        pool.close().await;
        assert!(matches!(tx.commit().await, Err(MqError::Closed)));
    }

    #[test]
    fn test_drop_without_commit_is_silent() {
        let pool = test_pool();
        let queue = Queue::new(pool.clone(), "", "q1");

        let mut tx = Transaction::new(pool);
        tx.send(&queue, &json!({"a": 1}), None).unwrap();
        drop(tx); // No backend call, no panic.
    }
}
