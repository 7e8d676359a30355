//! Path-routed handler table.
//!
//! A bidirectional map between webhook paths and queue names plus the
//! handler registered for each path. Registration is expected during
//! startup, before the dispatcher runs.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{MqError, Result};
use crate::queue::Queue;

/// Error type handlers report; converted to a DLQ reason string.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A webhook message handler.
///
/// Returning `Err` sends the message to the route's dead letter queue with
/// the stringified error as the reason; the error never propagates past
/// the dispatcher.
#[async_trait]
pub trait WebhookHandler: Send + Sync {
    async fn handle(&self, body: Value) -> std::result::Result<(), HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> WebhookHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send,
{
    async fn handle(&self, body: Value) -> std::result::Result<(), HandlerError> {
        (self.0)(body).await
    }
}

/// Wrap an async closure as a [`WebhookHandler`].
pub fn handler_fn<F, Fut>(f: F) -> impl WebhookHandler
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send,
{
    FnHandler(f)
}

/// A registered webhook route.
#[derive(Clone)]
pub struct Route {
    /// Normalized path, always starting with `/`.
    pub path: String,
    /// Queue name derived from the path.
    pub queue_name: String,
    pub(crate) handler: Arc<dyn WebhookHandler>,
    pub(crate) queue: Queue,
}

/// Insertion-ordered route table with O(1) lookup by path or queue name.
#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
    by_path: HashMap<String, usize>,
    by_queue: HashMap<String, usize>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalize a path: ensure a leading `/`, drop a trailing one.
    pub fn normalize_path(path: &str) -> String {
        let mut path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        if path != "/" && path.ends_with('/') {
            path.pop();
        }
        path
    }

    /// Derive the queue name for a normalized path.
    ///
    /// Separators become `_`, as does every other non-alphanumeric
    /// character; the result must be non-empty.
    pub fn queue_name_for(path: &str) -> Result<String> {
        let name: String = path
            .trim_matches('/')
            .chars()
            .map(|c| if c.is_alphanumeric() { c } else { '_' })
            .collect();
        if name.is_empty() {
            return Err(MqError::Message(format!(
                "path '{path}' does not map to a queue name"
            )));
        }
        Ok(name)
    }

    /// Insert a route, replacing any prior handler for the same path.
    pub fn insert(&mut self, route: Route) {
        match self.by_path.get(&route.path) {
            Some(&index) => {
                self.by_queue.remove(&self.routes[index].queue_name);
                self.by_queue.insert(route.queue_name.clone(), index);
                self.routes[index] = route;
            }
            None => {
                let index = self.routes.len();
                self.by_path.insert(route.path.clone(), index);
                self.by_queue.insert(route.queue_name.clone(), index);
                self.routes.push(route);
            }
        }
    }

    pub fn get_by_path(&self, path: &str) -> Option<&Route> {
        self.by_path.get(path).map(|&i| &self.routes[i])
    }

    pub fn get_by_queue(&self, queue_name: &str) -> Option<&Route> {
        self.by_queue.get(queue_name).map(|&i| &self.routes[i])
    }

    /// Routes in registration order.
    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MqConfig;
    use crate::redis::RedisPool;

    fn test_route(path: &str, marker: &'static str) -> Route {
        let pool = Arc::new(RedisPool::new(MqConfig::default()).unwrap());
        let normalized = Router::normalize_path(path);
        let queue_name = Router::queue_name_for(&normalized).unwrap();
        let queue = Queue::new(pool, "webhook:", &queue_name);
        Route {
            path: normalized,
            queue_name,
            handler: Arc::new(handler_fn(move |_body| async move {
                let _ = marker;
                Ok(())
            })),
            queue,
        }
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(Router::normalize_path("/order/status/"), "/order/status");
        assert_eq!(Router::normalize_path("order/status"), "/order/status");
        assert_eq!(Router::normalize_path("/"), "/");
    }

    #[test]
    fn test_queue_name_derivation() {
        assert_eq!(Router::queue_name_for("/order/status").unwrap(), "order_status");
        assert_eq!(Router::queue_name_for("/o/s").unwrap(), "o_s");
        assert_eq!(
            Router::queue_name_for("/order-events/v2").unwrap(),
            "order_events_v2"
        );
        assert!(Router::queue_name_for("/").is_err());
    }

    #[test]
    fn test_lookup_by_both_keys() {
        let mut router = Router::new();
        router.insert(test_route("/order/status", "a"));
        router.insert(test_route("/billing", "b"));

        assert_eq!(router.len(), 2);
        assert_eq!(
            router.get_by_path("/order/status").unwrap().queue_name,
            "order_status"
        );
        assert_eq!(
            router.get_by_queue("billing").unwrap().path,
            "/billing"
        );
        assert!(router.get_by_path("/missing").is_none());
    }

    #[test]
    fn test_reregistration_replaces_in_place() {
        let mut router = Router::new();
        router.insert(test_route("/a", "first"));
        router.insert(test_route("/b", "second"));
        router.insert(test_route("/a", "replacement"));

        assert_eq!(router.len(), 2);
        // Insertion order preserved: /a is still first.
        assert_eq!(router.routes()[0].path, "/a");
        assert_eq!(router.routes()[1].path, "/b");
    }
}
