use super::health::{self, HealthPolicy};
use crate::error::{DaemonError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Everything needed to launch one engine instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub binary: PathBuf,
    pub port: u16,
    pub workers: usize,
    pub model: Option<PathBuf>,
    pub test: bool,
    pub quiet: bool,
}

impl LaunchSpec {
    /// `--daemon --threads --quiet --port <P> --num_children <N> [-i <model>] [-t]`
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "--daemon".to_string(),
            "--threads".to_string(),
            "--quiet".to_string(),
            "--port".to_string(),
            self.port.to_string(),
            "--num_children".to_string(),
            self.workers.to_string(),
        ];

        if let Some(model) = &self.model {
            args.push("-i".to_string());
            args.push(model.display().to_string());
        }

        if self.test {
            args.push("-t".to_string());
        }

        args
    }
}

/// Extended regex matching the command line of an engine bound to `port`.
///
/// Anchored on the binary's file name so the supervisor's own command line
/// (which may mention the same port) is never counted, and on the port
/// being followed by a space or end of line so `--port 26542` does not
/// match `--port 265420`.
pub fn port_pattern(binary: &Path, port: u16) -> String {
    let name = binary
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| binary.display().to_string());
    format!("^(\\S*/)?{} .*--port {}( |$)", escape_ere(&name), port)
}

fn escape_ere(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if "\\.^$|?*+()[]{}".contains(ch) {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

/// Low-level process primitives for one engine binary.
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Launch detached; returns once the process is spawned.
    async fn launch(&self, spec: &LaunchSpec) -> Result<()>;

    /// Forcefully kill everything bound to `port`. Killing nothing is not an error.
    async fn kill(&self, port: u16) -> Result<()>;

    /// Number of live processes (parent and workers) bound to `port`.
    async fn count(&self, port: u16) -> Result<usize>;
}

/// `ProcessControl` backed by `pgrep`/`pkill`.
///
/// `pgrep` is run directly rather than through a shell, so it never matches
/// itself and the count needs no correction.
pub struct ShellProcessControl {
    binary: PathBuf,
}

impl ShellProcessControl {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn pattern(&self, port: u16) -> String {
        port_pattern(&self.binary, port)
    }
}

#[async_trait]
impl ProcessControl for ShellProcessControl {
    async fn launch(&self, spec: &LaunchSpec) -> Result<()> {
        let mut cmd = Command::new(&spec.binary);
        cmd.args(spec.args());
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(false);

        if spec.quiet {
            cmd.stdout(Stdio::null());
            cmd.stderr(Stdio::null());
        } else {
            cmd.stdout(Stdio::piped());
            cmd.stderr(Stdio::piped());
        }

        debug!("Launching {} {:?}", spec.binary.display(), spec.args());

        let mut child = cmd.spawn().map_err(|source| DaemonError::Launch {
            binary: spec.binary.clone(),
            source,
        })?;

        info!(port = spec.port, pid = ?child.id(), "Launched prediction daemon");

        if let Some(stdout) = child.stdout.take() {
            forward_output(spec.port, stdout, false);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(spec.port, stderr, true);
        }

        // The engine daemonizes itself; reap the launcher without blocking the caller.
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => debug!(?status, "Daemon launcher exited"),
                Err(e) => warn!("Failed to wait for daemon launcher: {}", e),
            }
        });

        Ok(())
    }

    async fn kill(&self, port: u16) -> Result<()> {
        let pattern = self.pattern(port);
        debug!(port, pattern = %pattern, "Killing daemon");

        let status = Command::new("pkill")
            .args(["-9", "-f", pattern.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| DaemonError::ProcessQuery(format!("failed to run pkill: {e}")))?;

        // 0 = killed something, 1 = nothing matched
        match status.code() {
            Some(0) | Some(1) => Ok(()),
            code => Err(DaemonError::ProcessQuery(format!(
                "pkill exited with {code:?}"
            ))),
        }
    }

    async fn count(&self, port: u16) -> Result<usize> {
        let pattern = self.pattern(port);
        let output = Command::new("pgrep")
            .args(["-f", pattern.as_str()])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| DaemonError::ProcessQuery(format!("failed to run pgrep: {e}")))?;

        match output.status.code() {
            Some(0) => parse_pid_list(&String::from_utf8_lossy(&output.stdout)),
            Some(1) => Ok(0),
            code => Err(DaemonError::ProcessQuery(format!(
                "pgrep exited with {code:?}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
        }
    }
}

fn parse_pid_list(stdout: &str) -> Result<usize> {
    let mut count = 0;
    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        line.parse::<u32>()
            .map_err(|_| DaemonError::ProcessQuery(format!("unexpected pgrep output {line:?}")))?;
        count += 1;
    }
    Ok(count)
}

fn forward_output<R>(port: u16, stream: R, is_stderr: bool)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if is_stderr {
                warn!(port, "{}", line);
            } else {
                debug!(port, "{}", line);
            }
        }
    });
}

/// Lifecycle operations built on a `ProcessControl`.
#[derive(Clone)]
pub struct ProcessController {
    control: Arc<dyn ProcessControl>,
    stop_policy: HealthPolicy,
}

impl ProcessController {
    pub fn new(control: Arc<dyn ProcessControl>, stop_policy: HealthPolicy) -> Self {
        Self {
            control,
            stop_policy,
        }
    }

    /// Launch an instance, clearing anything already squatting its port.
    pub async fn start(&self, spec: &LaunchSpec) -> Result<()> {
        let squatting = self.control.count(spec.port).await?;
        if squatting > 0 {
            warn!(
                port = spec.port,
                processes = squatting,
                "Port already has a running daemon, stopping it first"
            );
            self.stop(spec.port).await?;
        }

        self.control.launch(spec).await
    }

    /// Kill everything on `port` and verify nothing survived.
    pub async fn stop(&self, port: u16) -> Result<()> {
        self.control.kill(port).await?;

        let outcome = health::poll_count(self.control.as_ref(), port, 0, self.stop_policy).await?;
        if !outcome.reached {
            return Err(DaemonError::StopFailed {
                port,
                remaining: outcome.observed,
            });
        }

        info!(port, "Daemon stopped");
        Ok(())
    }

    /// `true` once `workers + 1` processes are observed on `port`.
    pub async fn is_healthy(&self, port: u16, workers: usize, policy: HealthPolicy) -> Result<bool> {
        let outcome = health::poll_count(
            self.control.as_ref(),
            port,
            health::expected_processes(workers),
            policy,
        )
        .await?;
        Ok(outcome.reached)
    }

    /// Like `is_healthy`, but a miss is a `HealthTimeout` error.
    pub async fn await_healthy(&self, port: u16, workers: usize, policy: HealthPolicy) -> Result<()> {
        let expected = health::expected_processes(workers);
        let outcome = health::poll_count(self.control.as_ref(), port, expected, policy).await?;
        if outcome.reached {
            Ok(())
        } else {
            Err(DaemonError::HealthTimeout {
                port,
                expected,
                observed: outcome.observed,
                tries: policy.tries,
            })
        }
    }

    pub async fn workers_count(&self, port: u16) -> Result<usize> {
        self.control.count(port).await
    }
}
