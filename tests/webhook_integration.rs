//! End-to-end webhook layer tests.
//!
//! These run the router → dispatcher → DLQ path against a live backend,
//! so they are marked `#[ignore]`. Run them with a local Redis (≥ 5.0) on
//! the default port:
//!
//! ```sh
//! cargo test --test webhook_integration -- --ignored
//! ```

use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use leanmq::{MqConfig, ServiceState, Webhook, WebhookConfig};

fn test_webhook(label: &str) -> Webhook {
    let config = WebhookConfig {
        prefix: format!("leanmq-test:{}:{}:", label, Uuid::new_v4().simple()),
        block_secs: 1,
        install_signals: false,
        ..Default::default()
    };
    Webhook::new(MqConfig::default(), config).expect("webhook construction")
}

// =============================================================================
// Dispatch success path
// =============================================================================

#[tokio::test]
#[ignore]
async fn test_dispatch_invokes_handler_and_acknowledges() {
    let webhook = test_webhook("dispatch");

    let (tx, mut rx) = mpsc::channel::<Value>(8);
    webhook
        .register_fn("/order/status", move |body| {
            let tx = tx.clone();
            async move {
                tx.send(body).await.ok();
                Ok(())
            }
        })
        .await
        .unwrap();

    let id = webhook
        .send("/order/status", &json!({"id": "A-17", "state": "shipped"}))
        .await
        .unwrap();
    assert!(!id.is_empty());

    let processed = webhook.process_once(None, None).await.unwrap();
    assert_eq!(processed, 1);

    let received = rx.try_recv().expect("handler saw the message");
    assert_eq!(received["id"], "A-17");
    assert_eq!(received["state"], "shipped");
    // The webhook metadata rides inside the body.
    assert_eq!(received["_webhook"]["path"], "/order/status");

    let queue = webhook.mq().get_queue("order_status").await.unwrap().unwrap();
    assert_eq!(queue.info().await.unwrap().pending_count, 0);

    let stats = webhook.stats();
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.dead_lettered, 0);

    webhook.mq().delete_queue("order_status", true).await.unwrap();
    webhook.close().await;
}

#[tokio::test]
#[ignore]
async fn test_send_to_unregistered_path_creates_the_queue() {
    let webhook = test_webhook("lazy");

    webhook.send("/audit/log", &json!({"event": "login"})).await.unwrap();

    let queue = webhook.mq().get_queue("audit_log").await.unwrap();
    assert!(queue.is_some());
    assert_eq!(queue.unwrap().info().await.unwrap().message_count, 1);
    assert!(webhook
        .mq()
        .get_dead_letter_queue("audit_log")
        .await
        .unwrap()
        .is_some());

    webhook.mq().delete_queue("audit_log", true).await.unwrap();
    webhook.close().await;
}

// =============================================================================
// S7: handler failure moves the message to the DLQ
// =============================================================================

#[tokio::test]
#[ignore]
async fn test_handler_failure_dead_letters_the_message() {
    let webhook = test_webhook("failure");

    webhook
        .register_fn("/o/s/", |_body| async move { Err("nope".into()) })
        .await
        .unwrap();

    webhook.send("/o/s/", &json!({"id": 1})).await.unwrap();

    let processed = webhook.process_once(None, None).await.unwrap();
    assert_eq!(processed, 1);

    let source = webhook.mq().get_queue("o_s").await.unwrap().unwrap();
    let info = source.info().await.unwrap();
    assert_eq!(info.message_count, 0);
    assert_eq!(info.pending_count, 0);

    let dlq = webhook.mq().get_dead_letter_queue("o_s").await.unwrap().unwrap();
    let dead = dlq.claim(10, None, None).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].body["id"], 1);
    assert!(dead[0].error().unwrap().contains("nope"));
    assert_eq!(dead[0].source_queue(), Some("o_s"));

    let stats = webhook.stats();
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(stats.succeeded, 0);

    webhook.mq().delete_queue("o_s", true).await.unwrap();
    webhook.close().await;
}

// =============================================================================
// Background service
// =============================================================================

#[tokio::test]
#[ignore]
async fn test_service_processes_in_background() {
    let webhook = test_webhook("service");

    let (tx, mut rx) = mpsc::channel::<Value>(8);
    webhook
        .register_fn("/jobs", move |body| {
            let tx = tx.clone();
            async move {
                tx.send(body).await.ok();
                Ok(())
            }
        })
        .await
        .unwrap();

    let service = webhook.run_service();
    assert_eq!(service.state(), ServiceState::Running);

    webhook.send("/jobs", &json!({"job": 42})).await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("worker delivered within the deadline")
        .expect("channel open");
    assert_eq!(received["job"], 42);

    webhook.mq().delete_queue("jobs", true).await.unwrap();
    webhook.close().await;
    assert!(!service.is_alive());
}

// =============================================================================
// S8: graceful stop bound
// =============================================================================

#[tokio::test]
#[ignore]
async fn test_graceful_stop_while_idle() {
    let webhook = test_webhook("stop");
    webhook
        .register_fn("/quiet", |_body| async move { Ok(()) })
        .await
        .unwrap();

    let service = webhook.run_service();
    assert!(service.is_alive());

    // Let the worker settle into its blocking read.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = std::time::Instant::now();
    service.stop().await;
    let worker_timeout = Duration::from_secs(5);
    assert!(started.elapsed() < worker_timeout + Duration::from_secs(2));
    assert!(!service.is_alive());
    assert_eq!(service.state(), ServiceState::Stopped);

    webhook.mq().delete_queue("quiet", true).await.unwrap();
    webhook.close().await;
}
