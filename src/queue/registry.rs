//! Queue registry: tracks known queues in a backend-side set and owns the
//! queue-pair lifecycle.
//!
//! Key layout:
//! - `{prefix}__queues`: set of known queue names
//! - `{prefix}{name}`: the stream for a queue
//! - `{prefix}{name}:dlq`: the DLQ stream
//! - `{prefix}{name}__meta`: hash with `created_at` (ms) and `is_dlq`
//! - consumer group for `{name}`: `{name}__group`

use std::sync::Arc;

use futures::future::join_all;

use crate::error::{MqError, Result};
use crate::redis::{current_time_ms, RedisPool};

use super::queue::{Queue, QueueInfo};

/// Suffix marking a dead letter queue name.
const DLQ_SUFFIX: &str = ":dlq";

pub(crate) fn stream_key(prefix: &str, name: &str) -> String {
    format!("{prefix}{name}")
}

pub(crate) fn meta_key(prefix: &str, name: &str) -> String {
    format!("{prefix}{name}__meta")
}

pub(crate) fn registry_key(prefix: &str) -> String {
    format!("{prefix}__queues")
}

pub(crate) fn group_name(name: &str) -> String {
    format!("{name}__group")
}

pub(crate) fn dlq_name(name: &str) -> String {
    format!("{name}{DLQ_SUFFIX}")
}

pub(crate) fn is_dlq_name(name: &str) -> bool {
    name.ends_with(DLQ_SUFFIX)
}

pub(crate) fn main_name(name: &str) -> String {
    name.strip_suffix(DLQ_SUFFIX).unwrap_or(name).to_string()
}

/// Registry of known queues.
///
/// State lives in the backend (a set plus per-queue metadata hashes), so
/// queues survive process restarts and are visible to co-tenants sharing
/// the same prefix.
#[derive(Clone)]
pub struct QueueRegistry {
    pool: Arc<RedisPool>,
    prefix: String,
}

impl QueueRegistry {
    pub(crate) fn new(pool: Arc<RedisPool>, prefix: &str) -> Self {
        Self {
            pool,
            prefix: prefix.to_string(),
        }
    }

    pub(crate) fn handle(&self, name: &str) -> Queue {
        Queue::new(self.pool.clone(), &self.prefix, name)
    }

    /// Create a queue and its DLQ sibling. Idempotent: existing queues are
    /// reused, and `created_at` is only recorded when absent.
    ///
    /// The consumer group is anchored at the beginning of the stream so no
    /// messages are skipped when the group is recreated after a restart.
    pub async fn create_pair(&self, name: &str) -> Result<(Queue, Queue)> {
        if is_dlq_name(name) {
            return Err(MqError::Queue {
                queue: name.to_string(),
                reason: "cannot create a queue pair for a dead letter queue name".to_string(),
            });
        }

        let dlq = dlq_name(name);
        let key = stream_key(&self.prefix, name);
        let group = group_name(name);

        let mut cmd = redis::cmd("XGROUP");
        cmd.arg("CREATE").arg(&key).arg(&group).arg("0").arg("MKSTREAM");
        match self.pool.query::<()>(&cmd).await {
            Ok(()) => {
                tracing::info!(queue = %name, group = %group, "consumer group created");
            }
            Err(MqError::Backend(e)) if e.to_string().contains("BUSYGROUP") => {
                tracing::debug!(queue = %name, group = %group, "consumer group already exists");
            }
            Err(e) => return Err(e),
        }

        let now_ms = current_time_ms();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("SADD")
            .arg(registry_key(&self.prefix))
            .arg(name)
            .arg(&dlq)
            .ignore();
        pipe.cmd("HSETNX")
            .arg(meta_key(&self.prefix, name))
            .arg("created_at")
            .arg(now_ms)
            .ignore();
        pipe.cmd("HSET")
            .arg(meta_key(&self.prefix, name))
            .arg("is_dlq")
            .arg(0)
            .ignore();
        pipe.cmd("HSETNX")
            .arg(meta_key(&self.prefix, &dlq))
            .arg("created_at")
            .arg(now_ms)
            .ignore();
        pipe.cmd("HSET")
            .arg(meta_key(&self.prefix, &dlq))
            .arg("is_dlq")
            .arg(1)
            .ignore();
        self.pool.query_pipeline::<()>(&pipe).await?;

        tracing::debug!(queue = %name, dlq = %dlq, "queue pair registered");
        Ok((self.handle(name), self.handle(&dlq)))
    }

    /// Handle to a registered queue, or `None` when unknown.
    pub async fn get(&self, name: &str) -> Result<Option<Queue>> {
        let mut cmd = redis::cmd("SISMEMBER");
        cmd.arg(registry_key(&self.prefix)).arg(name);
        let registered: bool = self.pool.query(&cmd).await?;
        Ok(registered.then(|| self.handle(name)))
    }

    /// Handle to the DLQ paired with `name`, or `None` when unknown.
    pub async fn get_dlq(&self, name: &str) -> Result<Option<Queue>> {
        self.get(&dlq_name(name)).await
    }

    /// All registered queue names, sorted for stable output.
    pub async fn queue_names(&self) -> Result<Vec<String>> {
        let mut cmd = redis::cmd("SMEMBERS");
        cmd.arg(registry_key(&self.prefix));
        let mut names: Vec<String> = self.pool.query(&cmd).await?;
        names.sort();
        Ok(names)
    }

    /// Snapshot of every registered queue with live counts.
    pub async fn list(&self) -> Result<Vec<QueueInfo>> {
        let names = self.queue_names().await?;
        let handles: Vec<Queue> = names.iter().map(|n| self.handle(n)).collect();
        let infos = join_all(handles.iter().map(|q| q.info())).await;
        infos.into_iter().collect()
    }

    /// Unregister a queue and remove its stream and metadata. With
    /// `also_dlq` the sibling goes in the same pipeline.
    pub async fn delete(&self, name: &str, also_dlq: bool) -> Result<()> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("SREM")
            .arg(registry_key(&self.prefix))
            .arg(name)
            .ignore();
        pipe.cmd("DEL")
            .arg(stream_key(&self.prefix, name))
            .arg(meta_key(&self.prefix, name))
            .ignore();
        if also_dlq {
            let dlq = dlq_name(name);
            pipe.cmd("SREM")
                .arg(registry_key(&self.prefix))
                .arg(&dlq)
                .ignore();
            pipe.cmd("DEL")
                .arg(stream_key(&self.prefix, &dlq))
                .arg(meta_key(&self.prefix, &dlq))
                .ignore();
        }
        self.pool.query_pipeline::<()>(&pipe).await?;

        tracing::info!(queue = %name, also_dlq, "queue deleted");
        Ok(())
    }
}
