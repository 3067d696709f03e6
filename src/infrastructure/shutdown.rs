use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::watch;

#[async_trait]
pub trait Shutdown: Send + Sync {
    async fn shutdown(&self) -> Result<()>;
}

/// Broadcasts a single shutdown signal to every background task.
#[derive(Clone)]
pub struct ShutdownManager {
    shutdown_tx: watch::Sender<bool>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self { shutdown_tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Shutdown for ShutdownManager {
    async fn shutdown(&self) -> Result<()> {
        // send_replace succeeds even when no task is listening
        self.shutdown_tx.send_replace(true);
        Ok(())
    }
}

/// Resolves when the shutdown signal is raised or the sender is gone.
pub async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            break;
        }
    }
}
