use crate::daemon::{DaemonConfig, HealthPolicy, Tuning, DEFAULT_PORT};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_BINARY: &str = "vw";
const DEFAULT_WORKERS: usize = 4;

/// `[daemon]` table of config.toml
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonSection {
    /// Engine binary (e.g., "vw" or "/usr/local/bin/vw")
    pub binary: Option<PathBuf>,
    pub port: Option<u16>,
    pub workers: Option<usize>,
    /// Model artifact passed with `-i`
    pub model: Option<PathBuf>,
    /// Run the engine in test-only mode (`-t`)
    pub test: Option<bool>,
    /// Discard engine stdout/stderr instead of logging them
    pub quiet: Option<bool>,
    /// Hot-reload when the model file changes
    pub updatable: Option<bool>,
}

/// `[tuning]` table of config.toml, all durations in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct TuningSection {
    pub start_tries: Option<u32>,
    pub start_delay_ms: Option<u64>,
    pub stop_tries: Option<u32>,
    pub stop_delay_ms: Option<u64>,
    pub watch_interval_ms: Option<u64>,
    /// 0 waits forever
    pub checkout_timeout_ms: Option<u64>,
    pub drain_timeout_ms: Option<u64>,
    pub base_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub daemon: DaemonSection,
    pub tuning: TuningSection,
}

/// Values given on the command line; they win over file and environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub binary: Option<PathBuf>,
    pub port: Option<u16>,
    pub workers: Option<usize>,
    pub model: Option<PathBuf>,
    pub test: bool,
    pub verbose_engine: bool,
    pub no_watch: bool,
}

impl Settings {
    /// $VWD_CONFIG_DIR/config.toml or ~/.config/vwd/config.toml
    pub fn default_path() -> PathBuf {
        crate::clienv::config_dir().join("config.toml")
    }

    /// Load from `path`, or the default location when `None`. A missing
    /// default file yields defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (Self::default_path(), false),
        };
        tracing::trace!(path = %path.display(), "Loading settings");

        if !path.exists() {
            if explicit {
                anyhow::bail!("Config file {} does not exist", path.display());
            }
            tracing::trace!("Config file does not exist, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Layer environment variables over the file values.
    pub fn with_env(mut self) -> Self {
        let d = &mut self.daemon;
        d.binary = crate::clienv::binary().or(d.binary.take());
        d.port = crate::clienv::port().or(d.port);
        d.workers = crate::clienv::workers().or(d.workers);
        d.model = crate::clienv::model().or(d.model.take());
        self
    }

    pub fn with_overrides(mut self, o: &Overrides) -> Self {
        let d = &mut self.daemon;
        if o.binary.is_some() {
            d.binary = o.binary.clone();
        }
        if o.port.is_some() {
            d.port = o.port;
        }
        if o.workers.is_some() {
            d.workers = o.workers;
        }
        if o.model.is_some() {
            d.model = o.model.clone();
        }
        if o.test {
            d.test = Some(true);
        }
        if o.verbose_engine {
            d.quiet = Some(false);
        }
        if o.no_watch {
            d.updatable = Some(false);
        }
        self
    }

    pub fn binary(&self) -> PathBuf {
        self.daemon
            .binary
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BINARY))
    }

    pub fn port(&self) -> u16 {
        self.daemon.port.unwrap_or(DEFAULT_PORT)
    }

    pub fn daemon_config(&self) -> Result<DaemonConfig> {
        let model = self
            .daemon
            .model
            .clone()
            .context("No model artifact configured (use --model, VWD_MODEL or [daemon].model)")?;

        let config = DaemonConfig::new(self.binary(), model)
            .port(self.port())
            .workers(self.daemon.workers.unwrap_or(DEFAULT_WORKERS))
            .test(self.daemon.test.unwrap_or(false))
            .quiet(self.daemon.quiet.unwrap_or(true))
            .updatable(self.daemon.updatable.unwrap_or(true));
        config.validate()?;
        Ok(config)
    }

    /// Tuning from `[tuning]`; a zero try count is rejected.
    pub fn tuning(&self) -> Result<Tuning> {
        let defaults = Tuning::default();
        let t = &self.tuning;
        let ms = Duration::from_millis;

        Ok(Tuning {
            start: policy("start", t.start_tries, t.start_delay_ms, defaults.start)?,
            stop: policy("stop", t.stop_tries, t.stop_delay_ms, defaults.stop)?,
            watch_interval: t.watch_interval_ms.map(ms).unwrap_or(defaults.watch_interval),
            checkout_timeout: match t.checkout_timeout_ms {
                Some(0) => None,
                Some(v) => Some(ms(v)),
                None => defaults.checkout_timeout,
            },
            drain_timeout: t.drain_timeout_ms.map(ms).unwrap_or(defaults.drain_timeout),
            base_port: t.base_port,
        })
    }

    /// Stop-verification budget for one-off commands like `vwd stop`
    pub fn stop_policy(&self) -> Result<HealthPolicy> {
        Ok(self.tuning()?.stop)
    }
}

fn policy(
    name: &str,
    tries: Option<u32>,
    delay_ms: Option<u64>,
    default: HealthPolicy,
) -> Result<HealthPolicy> {
    let tries = tries.unwrap_or(default.tries);
    if tries == 0 {
        anyhow::bail!("[tuning].{name}_tries must be at least 1");
    }
    let delay = delay_ms.map(Duration::from_millis).unwrap_or(default.delay);
    Ok(HealthPolicy::new(tries, delay))
}
