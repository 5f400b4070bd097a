//! Graceful shutdown coordination.
//!
//! `ShutdownCoordinator` owns the broadcast signal every long-lived task
//! subscribes to and the completion notification the main loop waits on.
//! The actual multi-phase shutdown sequence (stop listeners, drain control
//! connections, drain relays, stop accounting sinks) lives in
//! [`crate::dispatcher`], which has the component handles to drive it.

use crate::Result;
use std::time::Duration;
use tokio::signal;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, error, info, warn};

/// Broadcasts the shutdown signal and tracks when every subscriber has
/// acknowledged it.
pub struct ShutdownCoordinator {
    shutdown_tx: broadcast::Sender<()>,
    shutdown_complete: std::sync::Arc<Notify>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shutdown_tx,
            shutdown_complete: std::sync::Arc::new(Notify::new()),
            timeout,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// A cloneable handle for tasks (like an accept loop) that need to
    /// hand a fresh subscription to each connection they spawn.
    pub fn sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    pub fn completion_handle(&self) -> std::sync::Arc<Notify> {
        std::sync::Arc::clone(&self.shutdown_complete)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Block until SIGHUP, SIGTERM, SIGINT, or Ctrl+C, then broadcast the
    /// shutdown signal to every subscriber.
    pub async fn listen_for_signals(&self) -> Result<()> {
        info!("shutdown signal listener starting");

        #[cfg(unix)]
        {
            let mut sighup = signal::unix::signal(signal::unix::SignalKind::hangup())?;
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

            tokio::select! {
                _ = sighup.recv() => info!("received SIGHUP, initiating graceful shutdown"),
                _ = sigterm.recv() => info!("received SIGTERM, initiating graceful shutdown"),
                _ = sigint.recv() => info!("received SIGINT, initiating graceful shutdown"),
                _ = signal::ctrl_c() => info!("received Ctrl+C, initiating graceful shutdown"),
            }
        }

        #[cfg(windows)]
        {
            signal::ctrl_c().await?;
            info!("received Ctrl+C, initiating graceful shutdown");
        }

        self.signal_shutdown();
        Ok(())
    }

    /// Broadcast the shutdown signal without waiting on an OS signal.
    /// Used by tests and by any in-process trigger (e.g. an admin command).
    pub fn signal_shutdown(&self) {
        if self.shutdown_tx.send(()).is_err() {
            warn!("no subscribers were listening for the shutdown signal");
        }
    }

    pub fn mark_complete(&self) {
        self.shutdown_complete.notify_waiters();
    }

    pub async fn wait_for_completion(&self) -> Result<()> {
        tokio::time::timeout(self.timeout + Duration::from_secs(5), self.shutdown_complete.notified())
            .await
            .map_err(|_| anyhow::anyhow!("shutdown did not complete within the expected window"))?;
        Ok(())
    }
}

/// A spawned task paired with a shutdown subscription, so callers can
/// cancel it if it doesn't finish on its own once shutdown starts.
pub struct ShutdownAwareTask {
    handle: tokio::task::JoinHandle<()>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl ShutdownAwareTask {
    pub fn spawn<F, Fut>(coordinator: &ShutdownCoordinator, task_name: &str, task_fn: F) -> Self
    where
        F: FnOnce(broadcast::Receiver<()>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let shutdown_rx = coordinator.subscribe();
        let task_name = task_name.to_string();

        let handle = tokio::spawn(async move {
            debug!(task = %task_name, "shutdown-aware task starting");
            task_fn(shutdown_rx).await;
            debug!(task = %task_name, "shutdown-aware task finished");
        });

        Self {
            handle,
            shutdown_rx: coordinator.subscribe(),
        }
    }

    pub async fn wait_for_completion_or_shutdown(mut self) -> Result<()> {
        tokio::select! {
            result = &mut self.handle => {
                match result {
                    Ok(()) => Ok(()),
                    Err(e) if e.is_cancelled() => Ok(()),
                    Err(e) => {
                        error!(error = %e, "shutdown-aware task failed");
                        Err(anyhow::anyhow!("task failed: {}", e))
                    }
                }
            }
            _ = self.shutdown_rx.recv() => {
                debug!("shutdown signal received, aborting task");
                self.handle.abort();
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test]
    async fn coordinator_can_be_subscribed_to() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let _receiver = coordinator.subscribe();
        let _completion = coordinator.completion_handle();
    }

    #[tokio::test]
    async fn signal_shutdown_reaches_subscribers() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let mut receiver = coordinator.subscribe();
        coordinator.signal_shutdown();
        assert!(receiver.recv().await.is_ok());
    }

    #[tokio::test]
    async fn shutdown_aware_task_is_cancelled_on_signal() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));

        let task = ShutdownAwareTask::spawn(&coordinator, "test_task", |mut shutdown_rx| async move {
            tokio::select! {
                _ = sleep(Duration::from_secs(10)) => {}
                _ = shutdown_rx.recv() => {}
            }
        });

        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            coordinator.signal_shutdown();
        });

        assert!(task.wait_for_completion_or_shutdown().await.is_ok());
    }

    #[tokio::test]
    async fn wait_for_completion_returns_once_marked() {
        let coordinator = ShutdownCoordinator::new(Duration::from_millis(50));
        let handle = coordinator.completion_handle();
        tokio::spawn(async move {
            sleep(Duration::from_millis(10)).await;
            handle.notify_waiters();
        });
        coordinator.wait_for_completion().await.unwrap();
    }
}
