use anyhow::{Context, Result};
use std::io::BufRead;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use vwd::config::{Overrides, Settings};
use vwd::{Daemon, DaemonError, WatcherHandle};

pub(crate) async fn cmd_run(settings: Settings, overrides: Overrides, json: bool) -> Result<()> {
    let settings = settings.with_overrides(&overrides);
    let config = settings.daemon_config()?;
    info!(
        binary = %config.binary.display(),
        port = config.port,
        workers = config.workers,
        model = %config.model.display(),
        "Starting prediction daemon"
    );

    let daemon = Daemon::with_engine(config, settings.tuning()?)
        .await
        .context("Failed to prepare daemon")?;

    if let Err(e) = daemon.run().await {
        if let Err(stop_err) = daemon.shutdown().await {
            warn!("Cleanup after failed start: {}", stop_err);
        }
        return Err(e).context("Failed to start daemon");
    }

    let watcher = daemon.take_watcher();
    let cancel_watch = watcher.as_ref().map(WatcherHandle::cancellation);

    let outcome = tokio::select! {
        r = serve_stdin(&daemon, json) => r,
        r = watch(watcher) => r,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, stopping");
            Ok(())
        }
    };

    if let Some(token) = cancel_watch {
        token.cancel();
    }
    if let Err(e) = daemon.shutdown().await {
        error!("Shutdown failed: {}", e);
        if outcome.is_ok() {
            return Err(e).context("Failed to stop daemon");
        }
    }
    outcome
}

/// One request per input line, one response per output line. A request that
/// fails in transport or returns garbage yields an empty line (`null` with `--json`).
async fn serve_stdin(daemon: &Daemon, json: bool) -> Result<()> {
    let mut lines = stdin_lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.recv().await {
        let line = line.context("Failed to read stdin")?;
        if line.trim().is_empty() {
            continue;
        }

        match daemon.predict(line.as_bytes()).await {
            Ok(prediction) => {
                let line = if json {
                    serde_json::to_string(&prediction)?
                } else {
                    prediction.to_string()
                };
                stdout.write_all(line.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
            }
            Err(e) if e.is_transport_fault() || matches!(e, DaemonError::MalformedResponse { .. }) => {
                warn!("Prediction failed: {}", e);
                let empty: &[u8] = if json { b"null\n" } else { b"\n" };
                stdout.write_all(empty).await?;
            }
            Err(e) => return Err(e).context("Prediction failed"),
        }
        stdout.flush().await?;
    }

    info!("Input closed");
    Ok(())
}

/// Read stdin on a plain thread so a blocked read never holds up runtime shutdown.
fn stdin_lines() -> mpsc::Receiver<std::io::Result<String>> {
    let (tx, rx) = mpsc::channel(64);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Resolves only if the model watcher fails.
async fn watch(watcher: Option<WatcherHandle>) -> Result<()> {
    if let Some(handle) = watcher {
        handle.wait().await.context("Model watcher failed")?;
    }
    std::future::pending().await
}
