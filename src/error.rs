use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("model artifact {} is not accessible: {source}", path.display())]
    ModelUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to launch {}: {source}", binary.display())]
    Launch {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("process query failed: {0}")]
    ProcessQuery(String),

    #[error(
        "daemon on port {port} did not reach {expected} processes after {tries} checks (last seen {observed})"
    )]
    HealthTimeout {
        port: u16,
        expected: usize,
        observed: usize,
        tries: u32,
    },

    #[error("daemon on port {port} still has {remaining} processes after kill")]
    StopFailed { port: u16, remaining: usize },

    #[error("failed to connect to 127.0.0.1:{port}: {source}")]
    Connect {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// Re-dialing a discarded pool slot failed; scoped to one request.
    #[error("failed to reconnect to 127.0.0.1:{port}: {source}")]
    Reconnect {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("daemon on port {port} closed the connection")]
    ConnectionClosed { port: u16 },

    #[error("no pooled connection became available within {0:?}")]
    CheckoutTimeout(Duration),

    #[error("connection pool for port {port} is closed")]
    PoolClosed { port: u16 },

    #[error("daemon on port {port} is not running")]
    NotRunning { port: u16 },

    #[error("prediction request is empty")]
    EmptyRequest,

    #[error("malformed prediction response {line:?}: {reason}")]
    MalformedResponse { line: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("model watcher failed: {0}")]
    Watcher(String),

    #[error("hot reload to port {port} failed: {source}")]
    SwapFailed {
        port: u16,
        #[source]
        source: Box<DaemonError>,
    },
}

impl DaemonError {
    /// Startup faults are configuration errors and must never be retried.
    pub fn is_startup_fault(&self) -> bool {
        matches!(
            self,
            Self::ModelUnavailable { .. }
                | Self::Launch { .. }
                | Self::Connect { .. }
                | Self::Config(_)
        )
    }

    /// Faults scoped to a single prediction; the daemon itself may still be fine.
    pub fn is_transport_fault(&self) -> bool {
        matches!(
            self,
            Self::Transport(_)
                | Self::Reconnect { .. }
                | Self::ConnectionClosed { .. }
                | Self::CheckoutTimeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, DaemonError>;
