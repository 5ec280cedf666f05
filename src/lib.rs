pub mod clienv;
pub mod config;
pub mod daemon;
pub mod error;

pub use daemon::{
    Daemon, DaemonConfig, DaemonState, Prediction, ProcessControl, Tuning, WatcherHandle,
};
pub use error::{DaemonError, Result};
