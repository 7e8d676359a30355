//! Webhook dispatcher: one iteration of claim → handle → ack-or-DLQ.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::Result;

use super::router::{Route, Router};

/// Counters for dispatcher activity.
#[derive(Debug, Default)]
pub struct DispatcherStats {
    /// Messages pulled off a queue and handed to a handler
    pub processed: AtomicU64,
    /// Messages acknowledged after a successful handler run
    pub succeeded: AtomicU64,
    /// Messages relocated to a DLQ after a handler failure
    pub dead_lettered: AtomicU64,
}

impl DispatcherStats {
    pub fn snapshot(&self) -> DispatcherStatsSnapshot {
        DispatcherStatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of dispatcher statistics
#[derive(Debug, Clone, Serialize)]
pub struct DispatcherStatsSnapshot {
    pub processed: u64,
    pub succeeded: u64,
    pub dead_lettered: u64,
}

/// Pulls messages from every routed queue and invokes the registered
/// handlers.
///
/// Handler failures never propagate: the failing message moves to the
/// route's DLQ with the stringified error as the reason. Errors reading a
/// particular route are logged and swallowed so the remaining routes still
/// get served.
pub struct Dispatcher {
    router: Arc<RwLock<Router>>,
    /// Claim-time consumer tag; unique per dispatcher so concurrent
    /// workers on the same group never collide.
    consumer: String,
    stats: DispatcherStats,
    processing: AtomicBool,
}

impl Dispatcher {
    pub(crate) fn new(router: Arc<RwLock<Router>>) -> Self {
        Self {
            router,
            consumer: format!("dispatcher-{}", Uuid::new_v4()),
            stats: DispatcherStats::default(),
            processing: AtomicBool::new(false),
        }
    }

    pub fn stats(&self) -> DispatcherStatsSnapshot {
        self.stats.snapshot()
    }

    /// Run one dispatch iteration over all routes in registration order.
    ///
    /// Only the first route may block (up to `block`); the rest claim
    /// non-blocking within the same iteration. Returns the number of
    /// messages processed (handled or dead-lettered). Overlapping blocking
    /// iterations are refused.
    pub async fn process_once(&self, block: Option<Duration>, count: usize) -> Result<usize> {
        let blocking = block.map_or(false, |d| !d.is_zero());
        if blocking && self.processing.swap(true, Ordering::AcqRel) {
            tracing::warn!("dispatcher iteration already in progress, skipping");
            return Ok(0);
        }

        let result = self.run_iteration(block, count).await;

        if blocking {
            self.processing.store(false, Ordering::Release);
        }
        result
    }

    async fn run_iteration(&self, block: Option<Duration>, count: usize) -> Result<usize> {
        let routes: Vec<Route> = self.router.read().await.routes().to_vec();

        let mut processed = 0;
        let mut remaining_block = block;
        for route in &routes {
            // Only the first route gets the blocking read.
            let claim_block = remaining_block.take();
            let messages = match route
                .queue
                .claim(count, claim_block, Some(&self.consumer))
                .await
            {
                Ok(messages) => messages,
                Err(e) => {
                    tracing::warn!(
                        path = %route.path,
                        queue = %route.queue_name,
                        error = %e,
                        "failed to read route, skipping this iteration"
                    );
                    continue;
                }
            };

            for message in messages {
                let id = message.id.clone();
                match route.handler.handle(message.body).await {
                    Ok(()) => {
                        match route.queue.acknowledge(std::slice::from_ref(&id)).await {
                            Ok(_) => {
                                self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(e) => {
                                // Left pending; the reclaim path redelivers it.
                                tracing::warn!(
                                    path = %route.path,
                                    id = %id,
                                    error = %e,
                                    "failed to acknowledge handled message"
                                );
                            }
                        }
                    }
                    Err(handler_err) => {
                        let reason = handler_err.to_string();
                        tracing::warn!(
                            path = %route.path,
                            id = %id,
                            error = %reason,
                            "handler failed, moving message to dead letter queue"
                        );
                        match route
                            .queue
                            .move_to_dlq(std::slice::from_ref(&id), &reason, None)
                            .await
                        {
                            Ok(_) => {
                                self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(e) => {
                                tracing::error!(
                                    path = %route.path,
                                    id = %id,
                                    error = %e,
                                    "failed to move message to dead letter queue"
                                );
                            }
                        }
                    }
                }
                processed += 1;
                self.stats.processed.fetch_add(1, Ordering::Relaxed);
            }
        }

        Ok(processed)
    }
}
