//! Supervisor for an external prediction daemon
//!
//! Manages one engine process (a parent plus `N` worker children bound to a
//! TCP port) and the connections used to talk to it:
//! - Process lifecycle (start, stop, worker-count health checks)
//! - A bounded pool of connections serialising concurrent predictions
//! - Zero-downtime hot reload when the model artifact changes on disk
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                 Daemon handle                 │
//! │   Arc<DaemonInstance> ── swapped on reload    │
//! ├───────────────┬───────────────┬───────────────┤
//! │ ProcessCtrl   │ ConnectionPool│ ModelWatcher  │
//! │ (pgrep/pkill) │ (workers / 2) │ (mtime poll)  │
//! ├───────────────┴───────────────┴───────────────┤
//! │   engine :P  ◄── recreate ──►  engine :P+1    │
//! └───────────────────────────────────────────────┘
//! ```

pub mod handle;
pub mod health;
pub mod model;
pub mod pool;
pub mod process;
pub mod protocol;
pub mod supervisor;
pub mod watcher;

#[cfg(test)]
pub(crate) mod testing;

pub use handle::{Daemon, DaemonConfig, DaemonInstance, Tuning, DEFAULT_PORT};
pub use health::HealthPolicy;
pub use model::ModelRef;
pub use pool::{ConnectionPool, PooledConnection};
pub use process::{LaunchSpec, ProcessControl, ProcessController, ShellProcessControl};
pub use protocol::{DaemonState, Prediction};
pub use watcher::WatcherHandle;
