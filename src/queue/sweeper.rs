//! TTL-driven expiration sweep.
//!
//! Walks every registered queue in bounded batches and removes entries
//! whose deadline has passed. Intended to run periodically out-of-band;
//! safe to run alongside producers and consumers since deleting an
//! already-deleted id is a no-op.

use std::sync::Arc;

use chrono::Utc;
use redis::streams::StreamRangeReply;

use crate::error::Result;
use crate::redis::RedisPool;

use super::message::{field_string, FIELD_EXPIRES_AT};
use super::registry::{group_name, is_dlq_name, stream_key, QueueRegistry};

/// Entries scanned per XRANGE batch.
const SWEEP_BATCH: usize = 100;

/// Removes expired messages across all registered queues.
pub struct ExpirationSweeper {
    pool: Arc<RedisPool>,
    registry: QueueRegistry,
    prefix: String,
}

impl ExpirationSweeper {
    pub(crate) fn new(pool: Arc<RedisPool>, registry: QueueRegistry, prefix: &str) -> Self {
        Self {
            pool,
            registry,
            prefix: prefix.to_string(),
        }
    }

    /// Sweep every registered queue once. Returns the total removed.
    ///
    /// O(N) in total queue size per call; scheduling frequency is the
    /// embedding application's decision.
    pub async fn sweep_expired(&self) -> Result<u64> {
        let names = self.registry.queue_names().await?;

        let mut removed = 0;
        for name in &names {
            removed += self.sweep_queue(name).await?;
        }

        if removed > 0 {
            tracing::info!(removed, queues = names.len(), "expired messages swept");
        }
        Ok(removed)
    }

    async fn sweep_queue(&self, name: &str) -> Result<u64> {
        let key = stream_key(&self.prefix, name);
        let group = (!is_dlq_name(name)).then(|| group_name(name));
        let now_ms = Utc::now().timestamp_millis();

        let mut removed = 0;
        let mut cursor = "-".to_string();

        loop {
            let mut cmd = redis::cmd("XRANGE");
            cmd.arg(&key).arg(&cursor).arg("+").arg("COUNT").arg(SWEEP_BATCH);
            let batch: StreamRangeReply = self.pool.query(&cmd).await?;
            if batch.ids.is_empty() {
                break;
            }

            let scanned = batch.ids.len();
            let mut expired: Vec<String> = Vec::new();
            for entry in &batch.ids {
                let deadline = field_string(&entry.map, FIELD_EXPIRES_AT)
                    .and_then(|s| s.parse::<i64>().ok());
                if matches!(deadline, Some(ms) if ms <= now_ms) {
                    expired.push(entry.id.clone());
                }
            }
            // Next batch starts just after the last id we saw.
            cursor = format!("({}", batch.ids.last().map(|e| e.id.as_str()).unwrap_or("-"));

            if !expired.is_empty() {
                let mut pipe = redis::pipe();
                if let Some(group) = &group {
                    pipe.cmd("XACK").arg(&key).arg(group).arg(&expired).ignore();
                }
                pipe.cmd("XDEL").arg(&key).arg(&expired);
                let (deleted,): (u64,) = self.pool.query_pipeline(&pipe).await?;
                removed += deleted;

                tracing::debug!(queue = %name, expired = expired.len(), deleted, "swept batch");
            }

            if scanned < SWEEP_BATCH {
                break;
            }
        }

        Ok(removed)
    }
}
