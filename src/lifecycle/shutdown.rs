//! Signal handling for graceful shutdown

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::debug;

/// Handles shutdown signals (SIGTERM, SIGINT) and programmatic requests
pub struct ShutdownSignal {
    trigger_rx: watch::Receiver<bool>,
    trigger_tx: watch::Sender<bool>,
}

/// Requests shutdown from inside the process
#[derive(Clone)]
pub struct ShutdownTrigger(watch::Sender<bool>);

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.0.send_replace(true);
    }
}

impl ShutdownSignal {
    /// Create a new shutdown signal handler
    pub fn new() -> Self {
        let (trigger_tx, trigger_rx) = watch::channel(false);
        Self { trigger_rx, trigger_tx }
    }

    pub fn trigger(&self) -> ShutdownTrigger {
        ShutdownTrigger(self.trigger_tx.clone())
    }

    /// Wait for a shutdown signal or trigger
    pub async fn wait(&self) -> Result<()> {
        let mut sigterm = signal(SignalKind::terminate())
            .context("failed to register SIGTERM handler")?;
        let mut sigint = signal(SignalKind::interrupt())
            .context("failed to register SIGINT handler")?;
        let mut trigger_rx = self.trigger_rx.clone();

        tokio::select! {
            _ = sigterm.recv() => {
                debug!("received SIGTERM");
            }
            _ = sigint.recv() => {
                debug!("received SIGINT");
            }
            _ = trigger_rx.wait_for(|stop| *stop) => {
                debug!("shutdown requested");
            }
        }
        Ok(())
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_trigger_ends_wait() {
        let shutdown = ShutdownSignal::new();
        let trigger = shutdown.trigger();
        tokio::spawn(async move { trigger.trigger() });
        let waited = tokio::time::timeout(Duration::from_secs(2), shutdown.wait()).await;
        assert!(matches!(waited, Ok(Ok(()))));
    }

    #[tokio::test]
    async fn test_trigger_before_wait() {
        let shutdown = ShutdownSignal::new();
        shutdown.trigger().trigger();
        tokio_test::assert_ok!(shutdown.wait().await);
    }
}
