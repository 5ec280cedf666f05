use anyhow::{Context, Result};
use std::sync::Arc;
use vwd::config::Settings;
use vwd::daemon::{ProcessController, ShellProcessControl};

pub(crate) async fn cmd_stop(settings: &Settings, port: Option<u16>) -> Result<()> {
    let port = port.unwrap_or_else(|| settings.port());
    let controller = ProcessController::new(
        Arc::new(ShellProcessControl::new(settings.binary())),
        settings.stop_policy()?,
    );

    controller
        .stop(port)
        .await
        .with_context(|| format!("Failed to stop engine on port {}", port))?;
    println!("Engine on port {} stopped", port);
    Ok(())
}
