//! Supervisor for the dispatcher's background worker.
//!
//! Owns one worker task that repeatedly runs dispatch iterations. Shutdown
//! is cooperative: the stop signal is honored at iteration boundaries, so
//! keep the blocking-read window small for responsive stops.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::config::WebhookConfig;

use super::dispatcher::Dispatcher;

/// Pause after a failed iteration before trying again.
const ERROR_PAUSE: Duration = Duration::from_secs(1);

/// Supervisor lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    New,
    Running,
    Stopping,
    Stopped,
}

impl ServiceState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ServiceState::New,
            1 => ServiceState::Running,
            2 => ServiceState::Stopping,
            _ => ServiceState::Stopped,
        }
    }
}

/// Background service driving a [`Dispatcher`].
///
/// `start()` on a non-new service and `stop()` on a non-running service
/// are no-ops, so teardown is idempotent.
pub struct WebhookService {
    dispatcher: Arc<Dispatcher>,
    config: WebhookConfig,
    state: Arc<AtomicU8>,
    shutdown_tx: broadcast::Sender<()>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl WebhookService {
    pub(crate) fn new(dispatcher: Arc<Dispatcher>, config: WebhookConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            dispatcher,
            config,
            state: Arc::new(AtomicU8::new(ServiceState::New as u8)),
            shutdown_tx,
            worker: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ServiceState {
        ServiceState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Spawn the worker. No-op unless the service is new.
    ///
    /// Must be called within a tokio runtime. With `install_signals` set, a
    /// helper task routes SIGINT/SIGTERM into the same drain path as
    /// [`stop`](Self::stop).
    pub fn start(&self) {
        if self
            .state
            .compare_exchange(
                ServiceState::New as u8,
                ServiceState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            tracing::debug!("webhook service already started");
            return;
        }

        let dispatcher = self.dispatcher.clone();
        let config = self.config.clone();
        let state = self.state.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let block = (config.block_secs > 0).then(|| Duration::from_secs(config.block_secs));
            tracing::info!(
                batch_size = config.batch_size,
                block_secs = config.block_secs,
                process_interval_secs = config.process_interval_secs,
                "webhook service worker started"
            );

            loop {
                let idle = match dispatcher.process_once(block, config.batch_size).await {
                    Ok(0) => config.process_interval(),
                    Ok(processed) => {
                        tracing::debug!(processed, "dispatcher iteration complete");
                        Duration::ZERO
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "dispatcher iteration failed");
                        ERROR_PAUSE
                    }
                };

                // Iteration boundary: this is where stop() takes effect.
                tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(idle) => {}
                }
            }

            state.store(ServiceState::Stopped as u8, Ordering::Release);
            tracing::info!("webhook service worker stopped");
        });

        if let Ok(mut worker) = self.worker.lock() {
            *worker = Some(handle);
        }

        if self.config.install_signals {
            self.spawn_signal_listener();
        }
    }

    /// Route SIGINT/SIGTERM into the shutdown channel. The listener itself
    /// exits when the service stops first.
    fn spawn_signal_listener(&self) {
        let shutdown_tx = self.shutdown_tx.clone();
        let mut stop_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ctrl_c = async {
                if let Err(e) = signal::ctrl_c().await {
                    tracing::error!(error = %e, "failed to install Ctrl+C handler");
                    std::future::pending::<()>().await;
                }
            };

            #[cfg(unix)]
            let terminate = async {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut sig) => {
                        sig.recv().await;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "failed to install terminate handler");
                        std::future::pending::<()>().await;
                    }
                }
            };

            #[cfg(not(unix))]
            let terminate = std::future::pending::<()>();

            tokio::select! {
                _ = ctrl_c => {
                    tracing::info!("received Ctrl+C, stopping webhook service");
                }
                _ = terminate => {
                    tracing::info!("received terminate signal, stopping webhook service");
                }
                _ = stop_rx.recv() => return,
            }

            let _ = shutdown_tx.send(());
        });
    }

    /// Signal the worker to exit at its next iteration boundary and wait up
    /// to `worker_thread_timeout` for it. Returns regardless afterwards;
    /// the worker is cooperative, never force-killed. No-op unless running.
    pub async fn stop(&self) {
        if self
            .state
            .compare_exchange(
                ServiceState::Running as u8,
                ServiceState::Stopping as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            tracing::debug!("stop on a non-running webhook service is a no-op");
            return;
        }

        let _ = self.shutdown_tx.send(());

        let handle = self
            .worker
            .lock()
            .map(|mut worker| worker.take())
            .unwrap_or(None);
        if let Some(handle) = handle {
            match timeout(self.config.worker_thread_timeout(), handle).await {
                Ok(Ok(())) => tracing::info!("webhook service worker exited cleanly"),
                Ok(Err(e)) => tracing::warn!(error = %e, "webhook service worker task failed"),
                Err(_) => tracing::warn!(
                    timeout_secs = self.config.worker_thread_timeout_secs,
                    "webhook service worker did not stop in time"
                ),
            }
        }

        self.state
            .store(ServiceState::Stopped as u8, Ordering::Release);
        tracing::info!("webhook service stopped");
    }

    /// Whether the worker exists and has not exited.
    pub fn is_alive(&self) -> bool {
        self.worker
            .lock()
            .map(|worker| worker.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::router::Router;
    use tokio::sync::RwLock;

    fn test_service() -> WebhookService {
        let router = Arc::new(RwLock::new(Router::new()));
        let dispatcher = Arc::new(Dispatcher::new(router));
        let config = WebhookConfig {
            block_secs: 0,
            process_interval_secs: 1,
            install_signals: false,
            ..Default::default()
        };
        WebhookService::new(dispatcher, config)
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let service = test_service();
        assert_eq!(service.state(), ServiceState::New);
        assert!(!service.is_alive());

        service.start();
        assert_eq!(service.state(), ServiceState::Running);
        assert!(service.is_alive());

        service.stop().await;
        assert_eq!(service.state(), ServiceState::Stopped);
        assert!(!service.is_alive());
    }

    #[tokio::test]
    async fn test_stop_before_start_is_a_no_op() {
        let service = test_service();
        service.stop().await;
        assert_eq!(service.state(), ServiceState::New);
    }

    #[tokio::test]
    async fn test_restart_after_stop_is_a_no_op() {
        let service = test_service();
        service.start();
        service.stop().await;

        service.start();
        assert_eq!(service.state(), ServiceState::Stopped);
        assert!(!service.is_alive());
    }

    #[tokio::test]
    async fn test_double_start_spawns_once() {
        let service = test_service();
        service.start();
        service.start();
        assert!(service.is_alive());
        service.stop().await;
    }

    #[tokio::test]
    async fn test_stop_returns_within_timeout_bound() {
        let service = test_service();
        service.start();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        service.stop().await;
        assert!(started.elapsed() < service.config.worker_thread_timeout() + Duration::from_secs(2));
    }
}
