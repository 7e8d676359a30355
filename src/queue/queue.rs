//! Queue handle: publish, claim, acknowledge, delete, DLQ relocation,
//! requeue, purge and introspection for a single stream.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redis::streams::{
    StreamAutoClaimReply, StreamId, StreamPendingCountReply, StreamPendingReply,
    StreamRangeReply, StreamReadOptions, StreamReadReply,
};
use redis::AsyncCommands;
use serde::Serialize;

use crate::error::{MqError, Result};
use crate::redis::RedisPool;

use super::message::{self, Message};
use super::registry::{dlq_name, group_name, is_dlq_name, main_name, meta_key, registry_key, stream_key};

/// Consumer tag used when the caller does not supply one.
const DEFAULT_CONSUMER: &str = "consumer1";

/// Snapshot of a queue's state. May be stale by the time the caller reads it.
#[derive(Debug, Clone, Serialize)]
pub struct QueueInfo {
    pub name: String,
    pub is_dlq: bool,
    pub message_count: u64,
    pub consumer_group: Option<String>,
    pub pending_count: u64,
    pub created_at: Option<DateTime<Utc>>,
}

/// Handle to a single queue stream.
///
/// Cheap to clone; all backend access goes through the shared gateway.
/// Non-DLQ queues consume through their consumer group, DLQ handles read
/// the stream head directly without claim semantics.
#[derive(Clone)]
pub struct Queue {
    pool: Arc<RedisPool>,
    prefix: String,
    name: String,
    key: String,
    group: Option<String>,
    reclaim_idle: Duration,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("key", &self.key)
            .field("group", &self.group)
            .finish()
    }
}

impl Queue {
    pub(crate) fn new(pool: Arc<RedisPool>, prefix: &str, name: &str) -> Self {
        let group = if is_dlq_name(name) {
            None
        } else {
            Some(group_name(name))
        };
        let reclaim_idle = pool.config().reclaim_idle();

        Self {
            pool,
            prefix: prefix.to_string(),
            name: name.to_string(),
            key: stream_key(prefix, name),
            group,
            reclaim_idle,
        }
    }

    /// Logical queue name (without the backend key prefix).
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_dlq(&self) -> bool {
        self.group.is_none()
    }

    /// Name of the consumer group, if this queue has one.
    pub fn consumer_group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    pub(crate) fn stream_key_name(&self) -> &str {
        &self.key
    }

    /// Handle to the paired DLQ.
    fn paired_dlq(&self) -> Queue {
        Queue::new(self.pool.clone(), &self.prefix, &dlq_name(&self.name))
    }

    /// Handle to the paired non-DLQ queue.
    fn paired_main(&self) -> Queue {
        Queue::new(self.pool.clone(), &self.prefix, &main_name(&self.name))
    }

    /// Publish a message. Returns the backend-assigned id.
    ///
    /// The body must serialize to a JSON object. With `ttl` set the message
    /// becomes eligible for removal by the expiration sweep once the
    /// deadline passes.
    pub async fn publish<T: Serialize>(&self, body: &T, ttl: Option<Duration>) -> Result<String> {
        let value = serde_json::to_value(body)?;
        if !value.is_object() {
            return Err(MqError::Message(
                "message body must be a JSON object".to_string(),
            ));
        }

        let created_at = Utc::now();
        let expires_at =
            ttl.map(|t| created_at + chrono::Duration::milliseconds(t.as_millis() as i64));
        let fields = message::encode_fields(&value, created_at, expires_at, 0);

        let mut cmd = redis::cmd("XADD");
        cmd.arg(&self.key).arg("*").arg(&fields[..]);
        let id: String = self.pool.query(&cmd).await?;

        tracing::debug!(queue = %self.name, id = %id, ttl = ?ttl, "message published");
        Ok(id)
    }

    /// Claim up to `count` messages.
    ///
    /// Grouped queues first reclaim entries left pending past the
    /// reclaim-idle threshold (recovering work abandoned by crashed
    /// consumers), then read new messages, blocking up to `block` when the
    /// queue is empty. DLQ handles read from the stream head in insertion
    /// order without claim semantics.
    pub async fn claim(
        &self,
        count: usize,
        block: Option<Duration>,
        consumer: Option<&str>,
    ) -> Result<Vec<Message>> {
        if count == 0 {
            return Ok(Vec::new());
        }

        match &self.group {
            Some(group) => self.claim_grouped(group, count, block, consumer).await,
            None => self.read_head(count).await,
        }
    }

    async fn claim_grouped(
        &self,
        group: &str,
        count: usize,
        block: Option<Duration>,
        consumer: Option<&str>,
    ) -> Result<Vec<Message>> {
        let consumer = consumer.unwrap_or(DEFAULT_CONSUMER);
        let mut messages = Vec::new();

        // Entries idle past the threshold are claimable by any consumer.
        let mut cmd = redis::cmd("XAUTOCLAIM");
        cmd.arg(&self.key)
            .arg(group)
            .arg(consumer)
            .arg(self.reclaim_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(count);
        let reclaimed: StreamAutoClaimReply = self.pool.query(&cmd).await?;

        if !reclaimed.claimed.is_empty() {
            tracing::debug!(
                queue = %self.name,
                consumer = %consumer,
                count = reclaimed.claimed.len(),
                "reclaimed stalled pending entries"
            );
        }
        self.collect_entries(reclaimed.claimed, 1, &mut messages);

        if messages.len() >= count {
            return Ok(messages);
        }
        let remaining = count - messages.len();

        let block_ms = block
            .filter(|d| !d.is_zero())
            .map(|d| d.as_millis() as usize);
        let mut opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(remaining);
        if let Some(ms) = block_ms {
            opts = opts.block(ms);
        }

        // A blocked read occupies its connection, so it gets a dedicated one
        // instead of the shared pipeline. A BLOCK timeout parses as an empty
        // reply.
        let key = self.key.as_str();
        let opts = &opts;
        let reply: StreamReadReply = match block_ms {
            Some(_) => {
                let mut conn = self.pool.blocking_connection().await?;
                conn.xread_options(&[key], &[">"], opts).await?
            }
            None => {
                self.pool
                    .execute(|mut conn| async move {
                        conn.xread_options(&[key], &[">"], opts).await
                    })
                    .await?
            }
        };

        for stream_key in reply.keys {
            self.collect_entries(stream_key.ids, 1, &mut messages);
        }

        Ok(messages)
    }

    async fn read_head(&self, count: usize) -> Result<Vec<Message>> {
        let mut cmd = redis::cmd("XRANGE");
        cmd.arg(&self.key).arg("-").arg("+").arg("COUNT").arg(count);
        let reply: StreamRangeReply = self.pool.query(&cmd).await?;

        let mut messages = Vec::new();
        self.collect_entries(reply.ids, 0, &mut messages);
        Ok(messages)
    }

    /// Decode entries, skipping (with a warning) any that fail to parse.
    fn collect_entries(&self, entries: Vec<StreamId>, bump: u32, out: &mut Vec<Message>) {
        for entry in entries {
            match Message::from_entry(entry.id.clone(), &entry.map, bump) {
                Ok(msg) => out.push(msg),
                Err(e) => {
                    tracing::warn!(
                        queue = %self.name,
                        id = %entry.id,
                        error = %e,
                        "failed to decode stream entry, skipping"
                    );
                }
            }
        }
    }

    /// Mark ids as processed within the consumer group.
    ///
    /// Ids not in the pending set are ignored. Returns the count actually
    /// acknowledged. The entries remain in the stream.
    pub async fn acknowledge(&self, ids: &[String]) -> Result<u64> {
        let group = self.group.as_ref().ok_or_else(|| MqError::Queue {
            queue: self.name.clone(),
            reason: "queue has no consumer group to acknowledge against".to_string(),
        })?;
        if ids.is_empty() {
            return Ok(0);
        }

        let mut cmd = redis::cmd("XACK");
        cmd.arg(&self.key).arg(group).arg(ids);
        let acked: u64 = self.pool.query(&cmd).await?;

        tracing::debug!(queue = %self.name, requested = ids.len(), acked, "messages acknowledged");
        Ok(acked)
    }

    /// Remove entries from the stream entirely. Pending state is untouched;
    /// acknowledge first for clean pending accounting.
    pub async fn delete(&self, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut cmd = redis::cmd("XDEL");
        cmd.arg(&self.key).arg(ids);
        let removed: u64 = self.pool.query(&cmd).await?;

        tracing::debug!(queue = %self.name, requested = ids.len(), removed, "messages deleted");
        Ok(removed)
    }

    /// Move ids to a dead letter queue, annotating each body with the
    /// failure reason and the source queue.
    ///
    /// The relocation (publish to the DLQ, acknowledge, delete) commits as
    /// one atomic pipeline. Ids already gone from this queue are skipped
    /// silently. Returns the count successfully relocated.
    pub async fn move_to_dlq(
        &self,
        ids: &[String],
        reason: &str,
        target: Option<&Queue>,
    ) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let default_target;
        let target = match target {
            Some(t) => t,
            None => {
                if self.is_dlq() {
                    return Err(MqError::Queue {
                        queue: self.name.clone(),
                        reason: "a dead letter queue has no paired dead letter queue".to_string(),
                    });
                }
                default_target = self.paired_dlq();

                let mut cmd = redis::cmd("SISMEMBER");
                cmd.arg(registry_key(&self.prefix)).arg(&default_target.name);
                let registered: bool = self.pool.query(&cmd).await?;
                if !registered {
                    return Err(MqError::DlqNotFound(self.name.clone()));
                }
                &default_target
            }
        };

        self.relocate(ids, target, |body| {
            message::annotate_dead_letter(body, reason, &self.name)
        })
        .await
        .map(|moved| {
            if moved > 0 {
                tracing::info!(
                    queue = %self.name,
                    dlq = %target.name,
                    moved,
                    reason = %reason,
                    "messages moved to dead letter queue"
                );
            }
            moved
        })
    }

    /// Move ids from this DLQ back to a destination queue, stripping the
    /// dead-letter annotations. Only defined on a DLQ; the destination must
    /// be registered.
    pub async fn requeue(&self, ids: &[String], target: Option<&Queue>) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        if !self.is_dlq() {
            return Err(MqError::Queue {
                queue: self.name.clone(),
                reason: "requeue is only valid on a dead letter queue".to_string(),
            });
        }

        let default_target;
        let target = match target {
            Some(t) => t,
            None => {
                default_target = self.paired_main();
                &default_target
            }
        };

        let mut cmd = redis::cmd("SISMEMBER");
        cmd.arg(registry_key(&self.prefix)).arg(&target.name);
        let registered: bool = self.pool.query(&cmd).await?;
        if !registered {
            return Err(MqError::QueueNotFound(target.name.clone()));
        }

        self.relocate(ids, target, message::strip_dead_letter)
            .await
            .map(|moved| {
                if moved > 0 {
                    tracing::info!(
                        dlq = %self.name,
                        queue = %target.name,
                        moved,
                        "messages requeued from dead letter queue"
                    );
                }
                moved
            })
    }

    /// Shared move-semantics core for `move_to_dlq` and `requeue`.
    async fn relocate<F>(&self, ids: &[String], target: &Queue, mut rewrite: F) -> Result<u64>
    where
        F: FnMut(&mut serde_json::Value),
    {
        if ids.is_empty() {
            return Ok(0);
        }

        let bump = u32::from(!self.is_dlq());
        let mut moved: Vec<(String, Vec<(&'static str, String)>)> = Vec::new();
        for id in ids {
            let Some(entry) = self.read_entry(id).await? else {
                tracing::debug!(queue = %self.name, id = %id, "entry gone, skipping relocation");
                continue;
            };
            let mut msg = match Message::from_entry(id.clone(), &entry.map, 0) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(queue = %self.name, id = %id, error = %e, "undecodable entry, skipping relocation");
                    continue;
                }
            };

            rewrite(&mut msg.body);
            // Relocation off a live queue counts as a delivery.
            let fields = message::encode_fields(
                &msg.body,
                msg.created_at,
                msg.expires_at,
                msg.delivery_count + bump,
            );
            moved.push((id.clone(), fields));
        }

        if moved.is_empty() {
            return Ok(0);
        }

        let moved_ids: Vec<&String> = moved.iter().map(|(id, _)| id).collect();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (_, fields) in &moved {
            pipe.cmd("XADD")
                .arg(&target.key)
                .arg("*")
                .arg(&fields[..])
                .ignore();
        }
        if let Some(group) = &self.group {
            pipe.cmd("XACK")
                .arg(&self.key)
                .arg(group)
                .arg(&moved_ids)
                .ignore();
        }
        pipe.cmd("XDEL").arg(&self.key).arg(&moved_ids).ignore();
        self.pool.query_pipeline::<()>(&pipe).await?;

        Ok(moved.len() as u64)
    }

    async fn read_entry(&self, id: &str) -> Result<Option<StreamId>> {
        let mut cmd = redis::cmd("XRANGE");
        cmd.arg(&self.key).arg(id).arg(id);
        let reply: StreamRangeReply = self.pool.query(&cmd).await?;
        Ok(reply.ids.into_iter().next())
    }

    /// Remove every message and clear pending state. The queue and its
    /// consumer group survive. Returns the number removed.
    pub async fn purge(&self) -> Result<u64> {
        let removed: u64 = self.pool.query(redis::cmd("XLEN").arg(&self.key)).await?;

        if let Some(group) = &self.group {
            loop {
                let mut cmd = redis::cmd("XPENDING");
                cmd.arg(&self.key).arg(group).arg("-").arg("+").arg(100);
                let pending: StreamPendingCountReply = self.pool.query(&cmd).await?;
                if pending.ids.is_empty() {
                    break;
                }
                let ids: Vec<String> = pending.ids.iter().map(|p| p.id.clone()).collect();
                let done = ids.len() < 100;

                let mut cmd = redis::cmd("XACK");
                cmd.arg(&self.key).arg(group).arg(&ids);
                let _: u64 = self.pool.query(&cmd).await?;
                if done {
                    break;
                }
            }
        }

        let mut cmd = redis::cmd("XTRIM");
        cmd.arg(&self.key).arg("MAXLEN").arg(0);
        let _: u64 = self.pool.query(&cmd).await?;

        tracing::info!(queue = %self.name, removed, "queue purged");
        Ok(removed)
    }

    /// Read-only snapshot of this queue.
    pub async fn info(&self) -> Result<QueueInfo> {
        let message_count: u64 = self.pool.query(redis::cmd("XLEN").arg(&self.key)).await?;

        let pending_count = match &self.group {
            Some(group) => {
                let mut cmd = redis::cmd("XPENDING");
                cmd.arg(&self.key).arg(group);
                match self.pool.query::<StreamPendingReply>(&cmd).await {
                    Ok(reply) => reply.count() as u64,
                    // The group does not exist until the pair is created.
                    Err(MqError::Backend(e)) if e.to_string().contains("NOGROUP") => 0,
                    Err(e) => return Err(e),
                }
            }
            None => 0,
        };

        let mut cmd = redis::cmd("HGET");
        cmd.arg(meta_key(&self.prefix, &self.name))
            .arg("created_at");
        let created_ms: Option<i64> = self.pool.query(&cmd).await?;
        let created_at = created_ms.and_then(DateTime::from_timestamp_millis);

        Ok(QueueInfo {
            name: self.name.clone(),
            is_dlq: self.is_dlq(),
            message_count,
            consumer_group: self.group.clone(),
            pending_count,
            created_at,
        })
    }
}
