//! Graceful shutdown.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;

/// Default bound on graceful shutdown.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Broadcasts a one-way shutdown flag to any number of tasks.
pub struct ShutdownHandler {
    sender: watch::Sender<bool>,
    receiver: watch::Receiver<bool>,
}

impl ShutdownHandler {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self { sender, receiver }
    }

    /// Receiver that flips to `true` on shutdown.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.receiver.clone()
    }

    pub fn trigger(&self) {
        let _ = self.sender.send(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Wait for Ctrl+C, then trigger.
    pub async fn wait_for_ctrl_c(&self) -> std::io::Result<()> {
        tokio::signal::ctrl_c().await?;
        tracing::info!("received ctrl+c, initiating shutdown");
        self.trigger();
        Ok(())
    }
}

impl Default for ShutdownHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Run `shutdown_fn`, giving up after `limit`. Returns whether it finished.
pub async fn graceful_shutdown<F, Fut>(limit: Duration, shutdown_fn: F) -> bool
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ()>,
{
    match tokio::time::timeout(limit, shutdown_fn()).await {
        Ok(()) => {
            tracing::info!("graceful shutdown completed");
            true
        }
        Err(_) => {
            tracing::warn!(?limit, "graceful shutdown timed out");
            false
        }
    }
}
