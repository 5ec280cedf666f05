use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use vwd::config::Settings;
use vwd::daemon::{ProcessController, ShellProcessControl};
use vwd::DaemonState;

#[derive(Debug, Serialize)]
struct StatusReport {
    port: u16,
    state: DaemonState,
    processes: usize,
}

pub(crate) async fn cmd_status(settings: &Settings, port: Option<u16>, json: bool) -> Result<()> {
    let port = port.unwrap_or_else(|| settings.port());
    let controller = ProcessController::new(
        Arc::new(ShellProcessControl::new(settings.binary())),
        settings.stop_policy()?,
    );
    let processes = controller.workers_count(port).await?;
    let report = StatusReport {
        port,
        state: if processes > 0 {
            DaemonState::Running
        } else {
            DaemonState::Stopped
        },
        processes,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Port {}: {}", report.port, report.state.as_str());
    if processes > 0 {
        println!("  Processes: {} (parent + {} workers)", processes, processes - 1);
    }

    Ok(())
}
