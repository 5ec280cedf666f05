use super::handle::WeakDaemon;
use crate::error::{DaemonError, Result};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Background task polling a handle's model artifact.
pub struct WatcherHandle {
    token: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl WatcherHandle {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Token that stops the watcher at its next tick
    pub fn cancellation(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Cancel and wait for the loop to exit.
    pub async fn stop(self) -> Result<()> {
        self.token.cancel();
        self.wait().await
    }

    /// Wait for the loop to exit on its own: cancellation, a dropped handle,
    /// or a fatal error.
    pub async fn wait(self) -> Result<()> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(DaemonError::Watcher(e.to_string())),
        }
    }
}

pub(crate) fn spawn(daemon: WeakDaemon, interval: Duration) -> WatcherHandle {
    let token = CancellationToken::new();
    let task = tokio::spawn(watch(daemon, interval, token.clone()));
    WatcherHandle { token, task }
}

async fn watch(daemon: WeakDaemon, interval: Duration, token: CancellationToken) -> Result<()> {
    info!("Model watcher started (interval: {:?})", interval);

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("Model watcher cancelled");
                return Ok(());
            }
            _ = tokio::time::sleep(interval) => {}
        }

        let Some(daemon) = daemon.upgrade() else {
            debug!("Daemon handle dropped, model watcher exiting");
            return Ok(());
        };

        if let Err(e) = check_once(&daemon).await {
            error!(port = daemon.port(), "Model watcher stopping: {}", e);
            return Err(e);
        }
    }
}

async fn check_once(daemon: &super::Daemon) -> Result<()> {
    if daemon.model_changed().await? {
        daemon.reload_if_changed().await?;
    }
    Ok(())
}
