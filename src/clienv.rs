use std::path::PathBuf;

const FALLBACK_CONFIG_DIR: &str = "~/.config";
const VWD_SUBDIR: &str = "vwd";

pub const VWD_CONFIG_DIR: &str = "VWD_CONFIG_DIR";
pub const VWD_BINARY: &str = "VWD_BINARY";
pub const VWD_PORT: &str = "VWD_PORT";
pub const VWD_WORKERS: &str = "VWD_WORKERS";
pub const VWD_MODEL: &str = "VWD_MODEL";
pub const VWD_LOG: &str = "VWD_LOG";

fn env_opt(key: &str) -> Option<String> {
    dotenvy::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// vwd config directory ($VWD_CONFIG_DIR or ~/.config/vwd)
pub fn config_dir() -> PathBuf {
    let dir = env_opt(VWD_CONFIG_DIR)
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from(FALLBACK_CONFIG_DIR))
                .join(VWD_SUBDIR)
        });
    tracing::trace!(dir = %dir.display(), "Resolved config directory");
    dir
}

/// Engine binary override ($VWD_BINARY)
pub fn binary() -> Option<PathBuf> {
    let val = env_opt(VWD_BINARY).map(PathBuf::from);
    tracing::trace!(value = ?val, "VWD_BINARY env var");
    val
}

/// Port override ($VWD_PORT). Unparsable values are ignored.
pub fn port() -> Option<u16> {
    let val = env_opt(VWD_PORT).and_then(|s| s.parse().ok());
    tracing::trace!(value = ?val, "VWD_PORT env var");
    val
}

/// Worker count override ($VWD_WORKERS)
pub fn workers() -> Option<usize> {
    let val = env_opt(VWD_WORKERS).and_then(|s| s.parse().ok());
    tracing::trace!(value = ?val, "VWD_WORKERS env var");
    val
}

/// Model artifact override ($VWD_MODEL)
pub fn model() -> Option<PathBuf> {
    let val = env_opt(VWD_MODEL).map(PathBuf::from);
    tracing::trace!(value = ?val, "VWD_MODEL env var");
    val
}

/// Log filter ($VWD_LOG, falling back to $RUST_LOG)
pub fn log_filter() -> Option<String> {
    env_opt(VWD_LOG).or_else(|| env_opt("RUST_LOG"))
}
