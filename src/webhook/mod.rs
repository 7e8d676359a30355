//! Webhook-shaped façade over the queue runtime.
//!
//! Paths map deterministically to queues, handlers are registered per path,
//! and a background service consumes every routed queue with
//! DLQ-on-failure semantics. This keeps the developer experience of
//! internal HTTP webhooks while delivery runs over durable queues.
//!
//! # Modules
//!
//! - `router`: path ↔ queue mapping and the handler table
//! - `dispatcher`: one claim → handle → ack-or-DLQ iteration
//! - `service`: the supervised background worker

mod dispatcher;
mod router;
mod service;

pub use dispatcher::{Dispatcher, DispatcherStatsSnapshot};
pub use router::{handler_fn, HandlerError, Route, Router, WebhookHandler};
pub use service::{ServiceState, WebhookService};

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::config::{MqConfig, WebhookConfig};
use crate::core::LeanMq;
use crate::error::{MqError, Result};

/// Body key carrying webhook metadata on outgoing payloads.
const KEY_WEBHOOK: &str = "_webhook";

/// Webhook-style interface for service-to-service messaging.
pub struct Webhook {
    mq: LeanMq,
    router: Arc<RwLock<Router>>,
    dispatcher: Arc<Dispatcher>,
    config: WebhookConfig,
    service: Mutex<Option<Arc<WebhookService>>>,
}

impl Webhook {
    /// Build a webhook over its own queue service. The webhook prefix from
    /// `config` namespaces all backend keys.
    ///
    /// With `auto_start` set this spawns the background service
    /// immediately, so it must then be called within a tokio runtime.
    pub fn new(mq_config: MqConfig, config: WebhookConfig) -> Result<Self> {
        let mq_config = MqConfig {
            prefix: config.prefix.clone(),
            ..mq_config
        };
        let mq = LeanMq::new(mq_config)?;
        let router = Arc::new(RwLock::new(Router::new()));
        let dispatcher = Arc::new(Dispatcher::new(router.clone()));

        let webhook = Self {
            mq,
            router,
            dispatcher,
            config,
            service: Mutex::new(None),
        };
        if webhook.config.auto_start {
            webhook.run_service();
        }
        Ok(webhook)
    }

    /// The underlying queue service.
    pub fn mq(&self) -> &LeanMq {
        &self.mq
    }

    /// Register a handler for `path`, creating the queue pair behind it.
    /// Registering the same path again replaces the handler.
    pub async fn register<H>(&self, path: &str, handler: H) -> Result<()>
    where
        H: WebhookHandler + 'static,
    {
        let normalized = Router::normalize_path(path);
        let queue_name = Router::queue_name_for(&normalized)?;
        let (queue, _dlq) = self.mq.create_queue_pair(&queue_name).await?;

        let route = Route {
            path: normalized.clone(),
            queue_name,
            handler: Arc::new(handler),
            queue,
        };
        self.router.write().await.insert(route);

        tracing::info!(path = %normalized, "webhook route registered");
        Ok(())
    }

    /// [`register`](Self::register) with an async closure.
    pub async fn register_fn<F, Fut>(&self, path: &str, f: F) -> Result<()>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        self.register(path, handler_fn(f)).await
    }

    /// Send a webhook event to `path`. Returns the message id.
    ///
    /// Unknown paths get their queue pair created lazily, so senders do not
    /// depend on the receiving side having registered yet. The body is
    /// annotated with `_webhook` metadata (path and send time).
    pub async fn send<T: Serialize>(&self, path: &str, body: &T) -> Result<String> {
        let normalized = Router::normalize_path(path);
        let queue_name = Router::queue_name_for(&normalized)?;

        let registered = {
            let router = self.router.read().await;
            router.get_by_path(&normalized).map(|r| r.queue.clone())
        };
        let queue = match registered {
            Some(queue) => queue,
            None => match self.mq.get_queue(&queue_name).await? {
                Some(queue) => queue,
                None => self.mq.create_queue_pair(&queue_name).await?.0,
            },
        };

        let mut value = serde_json::to_value(body)?;
        let Some(map) = value.as_object_mut() else {
            return Err(MqError::Message(
                "webhook body must be a JSON object".to_string(),
            ));
        };
        map.insert(
            KEY_WEBHOOK.to_string(),
            json!({
                "path": normalized,
                "sent_at": Utc::now().timestamp_millis(),
            }),
        );

        queue.publish(&value, None).await
    }

    /// Run one dispatch iteration inline. `count` defaults to the
    /// configured batch size.
    pub async fn process_once(
        &self,
        block: Option<Duration>,
        count: Option<usize>,
    ) -> Result<usize> {
        self.dispatcher
            .process_once(block, count.unwrap_or(self.config.batch_size))
            .await
    }

    /// Dispatcher activity counters.
    pub fn stats(&self) -> DispatcherStatsSnapshot {
        self.dispatcher.stats()
    }

    /// Spawn (and keep) the supervised background service. Must be called
    /// within a tokio runtime.
    pub fn run_service(&self) -> Arc<WebhookService> {
        let service = Arc::new(WebhookService::new(
            self.dispatcher.clone(),
            self.config.clone(),
        ));
        service.start();
        if let Ok(mut slot) = self.service.lock() {
            *slot = Some(service.clone());
        }
        service
    }

    /// The running background service, if any.
    pub fn service(&self) -> Option<Arc<WebhookService>> {
        self.service.lock().ok().and_then(|slot| slot.clone())
    }

    /// Stop the background service (if running) and release backend
    /// resources. Idempotent.
    pub async fn close(&self) {
        let service = self
            .service
            .lock()
            .map(|mut slot| slot.take())
            .unwrap_or(None);
        if let Some(service) = service {
            service.stop().await;
        }
        self.mq.close().await;
    }
}
