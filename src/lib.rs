//! Reliable message queues over Redis Streams, with a webhook-shaped
//! developer experience.
//!
//! `LeanMq` replaces fragile internal HTTP webhooks between cooperating
//! services with durable, at-least-once delivery: queue pairs with dead
//! letter queues, consumer-group claims with crash recovery, atomic
//! multi-publish transactions, TTL expiration sweeps, and a path-routed
//! dispatcher that runs as a managed background service.
//!
//! # Queue API
//!
//! ```no_run
//! use leanmq::{LeanMq, MqConfig};
//! use serde_json::json;
//!
//! # async fn example() -> leanmq::Result<()> {
//! let mq = LeanMq::new(MqConfig::default())?;
//! let (orders, _dlq) = mq.create_queue_pair("orders").await?;
//!
//! orders.publish(&json!({"id": "A-17", "n": 1}), None).await?;
//! let messages = orders.claim(10, None, None).await?;
//! let ids: Vec<String> = messages.iter().map(|m| m.id.clone()).collect();
//! orders.acknowledge(&ids).await?;
//!
//! mq.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Webhook API
//!
//! ```no_run
//! use leanmq::{MqConfig, Webhook, WebhookConfig};
//! use serde_json::json;
//!
//! # async fn example() -> leanmq::Result<()> {
//! let webhook = Webhook::new(MqConfig::default(), WebhookConfig::default())?;
//! webhook
//!     .register_fn("/order/status", |body| async move {
//!         println!("order update: {body}");
//!         Ok(())
//!     })
//!     .await?;
//!
//! webhook.send("/order/status", &json!({"id": "A-17"})).await?;
//!
//! let service = webhook.run_service();
//! // ... the worker consumes in the background ...
//! service.stop().await;
//! webhook.close().await;
//! # Ok(())
//! # }
//! ```

// Backend gateway and shared infrastructure
pub mod config;
pub mod error;
pub mod redis;

// Queue runtime
pub mod core;
pub mod queue;

// Webhook layer
pub mod webhook;

pub use config::{MqConfig, WebhookConfig};
pub use core::LeanMq;
pub use error::{MqError, Result};
pub use queue::{Message, Queue, QueueInfo, Transaction};
pub use webhook::{
    handler_fn, HandlerError, ServiceState, Webhook, WebhookHandler, WebhookService,
};
