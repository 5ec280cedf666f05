use crate::error::{DaemonError, Result};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::trace;

/// Model artifact the daemon was launched with.
///
/// `modified` is the timestamp observed when this reference was created. A
/// reference is rebuilt (never mutated) when a reload commits, so a stale
/// `modified` is exactly the signal that a reload is due.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRef {
    pub path: PathBuf,
    pub modified: SystemTime,
    pub updatable: bool,
}

impl ModelRef {
    /// Stat the artifact and record its modification time.
    pub async fn stat(path: impl AsRef<Path>, updatable: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let modified = modified_at(&path).await?;
        trace!(path = %path.display(), ?modified, "Model artifact stat");
        Ok(Self {
            path,
            modified,
            updatable,
        })
    }

    /// Re-stat the artifact and compare against the stored timestamp.
    ///
    /// A missing artifact is an error, not "unchanged".
    pub async fn has_changed(&self) -> Result<bool> {
        let current = modified_at(&self.path).await?;
        Ok(current != self.modified)
    }
}

async fn modified_at(path: &Path) -> Result<SystemTime> {
    let unavailable = |source| DaemonError::ModelUnavailable {
        path: path.to_path_buf(),
        source,
    };
    let meta = tokio::fs::metadata(path).await.map_err(unavailable)?;
    meta.modified().map_err(unavailable)
}
