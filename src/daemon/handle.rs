use super::health::{HealthPolicy, START_POLICY, STOP_POLICY};
use super::model::ModelRef;
use super::pool::{self, ConnectionPool};
use super::process::{LaunchSpec, ProcessControl, ProcessController, ShellProcessControl};
use super::protocol::{self, DaemonState, Prediction};
use super::supervisor;
use super::watcher::{self, WatcherHandle};
use crate::error::{DaemonError, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::MutexGuard;
use tracing::{debug, error, info};

/// Well-known port of the first instance; reloads alternate with `DEFAULT_PORT + 1`.
pub const DEFAULT_PORT: u16 = 26542;

/// Identity of one daemon instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    pub binary: PathBuf,
    pub port: u16,
    pub workers: usize,
    pub model: PathBuf,
    pub test: bool,
    pub quiet: bool,
    /// Watch the model artifact and hot-reload on change
    pub updatable: bool,
}

impl DaemonConfig {
    pub fn new(binary: impl Into<PathBuf>, model: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            port: DEFAULT_PORT,
            workers: 4,
            model: model.into(),
            test: false,
            quiet: true,
            updatable: false,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn test(mut self, test: bool) -> Self {
        self.test = test;
        self
    }

    pub fn quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    pub fn updatable(mut self, updatable: bool) -> Self {
        self.updatable = updatable;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.binary.as_os_str().is_empty() {
            return Err(DaemonError::Config("engine binary path is empty".into()));
        }
        if pool::capacity_for(self.workers) == 0 {
            return Err(DaemonError::Config(format!(
                "at least 2 workers are required for a connection pool, got {}",
                self.workers
            )));
        }
        if self.port == u16::MAX {
            return Err(DaemonError::Config(
                "port must leave room for the alternate reload port".into(),
            ));
        }
        Ok(())
    }

    pub fn launch_spec(&self) -> LaunchSpec {
        LaunchSpec {
            binary: self.binary.clone(),
            port: self.port,
            workers: self.workers,
            model: Some(self.model.clone()),
            test: self.test,
            quiet: self.quiet,
        }
    }
}

/// Timing knobs shared by every instance a handle runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tuning {
    pub start: HealthPolicy,
    pub stop: HealthPolicy,
    pub watch_interval: Duration,
    /// `None` waits for a pooled connection forever
    pub checkout_timeout: Option<Duration>,
    pub drain_timeout: Duration,
    /// Port the reload rotation returns to; defaults to the handle's first port
    pub base_port: Option<u16>,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            start: START_POLICY,
            stop: STOP_POLICY,
            watch_interval: Duration::from_secs(1),
            checkout_timeout: Some(Duration::from_secs(30)),
            drain_timeout: Duration::from_secs(2),
            base_port: None,
        }
    }
}

/// Immutable state of the instance a handle currently points at.
#[derive(Debug)]
pub struct DaemonInstance {
    config: DaemonConfig,
    model: ModelRef,
    pool: Option<Arc<ConnectionPool>>,
}

impl DaemonInstance {
    pub(crate) fn stopped(config: DaemonConfig, model: ModelRef) -> Self {
        Self {
            config,
            model,
            pool: None,
        }
    }

    pub(crate) fn running(config: DaemonConfig, model: ModelRef, pool: Arc<ConnectionPool>) -> Self {
        Self {
            config,
            model,
            pool: Some(pool),
        }
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn model(&self) -> &ModelRef {
        &self.model
    }

    pub fn pool(&self) -> Option<&Arc<ConnectionPool>> {
        self.pool.as_ref()
    }

    pub fn state(&self) -> DaemonState {
        match self.pool {
            Some(ref pool) if !pool.is_closed() => DaemonState::Running,
            _ => DaemonState::Stopped,
        }
    }
}

struct Shared {
    current: RwLock<Arc<DaemonInstance>>,
    controller: ProcessController,
    tuning: Tuning,
    base_port: u16,
    /// Serialises run / stop / recreate. `predict` never takes it.
    lifecycle: tokio::sync::Mutex<()>,
    swapping: AtomicBool,
    watcher: Mutex<Option<WatcherHandle>>,
}

/// Handle to a supervised prediction daemon.
///
/// Clones share one underlying instance. A hot reload repoints every clone
/// at the replacement in a single swap, so holders never re-acquire a handle.
#[derive(Clone)]
pub struct Daemon {
    shared: Arc<Shared>,
}

/// Non-owning handle used by the model watcher
#[derive(Clone)]
pub(crate) struct WeakDaemon(Weak<Shared>);

impl WeakDaemon {
    pub(crate) fn upgrade(&self) -> Option<Daemon> {
        self.0.upgrade().map(|shared| Daemon { shared })
    }
}

impl Daemon {
    /// Build an unstarted handle. Fails if the model artifact cannot be stat'ed.
    ///
    /// With `updatable` set this also starts the model watcher, so it must be
    /// called inside a tokio runtime.
    pub async fn new(
        config: DaemonConfig,
        control: Arc<dyn ProcessControl>,
        tuning: Tuning,
    ) -> Result<Self> {
        config.validate()?;
        let model = ModelRef::stat(&config.model, config.updatable).await?;
        let updatable = config.updatable;

        let daemon = Self::from_instance(
            DaemonInstance::stopped(config, model),
            ProcessController::new(control, tuning.stop),
            tuning,
        );

        if updatable {
            let handle = watcher::spawn(daemon.downgrade(), daemon.shared.tuning.watch_interval);
            *daemon.shared.watcher.lock().expect("watcher lock poisoned") = Some(handle);
        }

        debug!(port = daemon.port(), "Daemon handle constructed");
        Ok(daemon)
    }

    /// Handle driving the real engine binary through `pgrep`/`pkill`.
    pub async fn with_engine(config: DaemonConfig, tuning: Tuning) -> Result<Self> {
        let control = Arc::new(ShellProcessControl::new(config.binary.clone()));
        Self::new(config, control, tuning).await
    }

    fn from_instance(instance: DaemonInstance, controller: ProcessController, tuning: Tuning) -> Self {
        let base_port = tuning.base_port.unwrap_or(instance.config.port);
        Self {
            shared: Arc::new(Shared {
                current: RwLock::new(Arc::new(instance)),
                controller,
                tuning,
                base_port,
                lifecycle: tokio::sync::Mutex::new(()),
                swapping: AtomicBool::new(false),
                watcher: Mutex::new(None),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> WeakDaemon {
        WeakDaemon(Arc::downgrade(&self.shared))
    }

    /// Launch the engine, wait for every worker, then fill the pool.
    pub async fn run(&self) -> Result<()> {
        let _lifecycle = self.lock_lifecycle().await;
        let current = self.instance();

        let pool = launch(&self.shared.controller, &self.shared.tuning, current.config()).await?;
        let previous = self.replace(Arc::new(DaemonInstance::running(
            current.config.clone(),
            current.model.clone(),
            pool,
        )));
        if let Some(pool) = previous.pool() {
            pool.close();
        }
        Ok(())
    }

    /// Send one request line and parse the daemon's response.
    ///
    /// Transport faults are returned for this request only; the broken
    /// connection is dropped and its pool slot re-dialed on next use. A
    /// request that races a hot reload and finds the retired pool closed is
    /// retried once against the replacement.
    pub async fn predict(&self, request: &[u8]) -> Result<Prediction> {
        self.predict_from(self.instance(), request).await
    }

    /// `predict` against an instance loaded earlier, possibly since retired.
    pub(crate) async fn predict_from(
        &self,
        instance: Arc<DaemonInstance>,
        request: &[u8],
    ) -> Result<Prediction> {
        let payload = protocol::terminate_line(request)?;

        match self.predict_on(&instance, &payload).await {
            Err(DaemonError::PoolClosed { port }) => {
                let current = self.instance();
                if Arc::ptr_eq(&current, &instance) {
                    return Err(DaemonError::PoolClosed { port });
                }
                debug!(from = port, to = current.config.port, "Retrying prediction on swapped instance");
                self.predict_on(&current, &payload).await
            }
            other => other,
        }
    }

    async fn predict_on(&self, instance: &DaemonInstance, payload: &[u8]) -> Result<Prediction> {
        let port = instance.config.port;
        let pool = instance.pool().ok_or(DaemonError::NotRunning { port })?;
        let mut conn = pool.checkout(self.shared.tuning.checkout_timeout).await?;

        match conn.round_trip(payload).await {
            Ok(line) => {
                conn.checkin();
                line.parse()
            }
            Err(e) => {
                error!(port, "Prediction transport failure: {}", e);
                conn.discard();
                Err(e)
            }
        }
    }

    /// Live process count (workers plus parent) on this handle's port
    pub async fn workers_count(&self) -> Result<usize> {
        self.shared.controller.workers_count(self.port()).await
    }

    pub async fn is_healthy(&self, tries: u32, delay: Duration) -> Result<bool> {
        self.shared
            .controller
            .is_healthy(self.port(), self.workers(), HealthPolicy::new(tries, delay))
            .await
    }

    /// Kill the engine on this handle's port and retire its pool.
    pub async fn stop(&self) -> Result<()> {
        let _lifecycle = self.lock_lifecycle().await;
        let current = self.instance();

        self.shared.controller.stop(current.config.port).await?;
        if let Some(pool) = current.pool() {
            pool.close();
        }
        self.replace(Arc::new(DaemonInstance::stopped(
            current.config.clone(),
            current.model.clone(),
        )));
        Ok(())
    }

    /// Stop the model watcher, then the engine.
    pub async fn shutdown(&self) -> Result<()> {
        if let Some(handle) = self.take_watcher() {
            if let Err(e) = handle.stop().await {
                error!("Model watcher ended with error: {}", e);
            }
        }
        info!(port = self.port(), "Shutting down daemon");
        self.stop().await
    }

    /// Recreate the instance on the alternate port and swap it in.
    pub async fn recreate(&self) -> Result<()> {
        supervisor::recreate(self).await
    }

    /// Recreate only if the model artifact changed since the last commit.
    pub async fn reload_if_changed(&self) -> Result<bool> {
        supervisor::reload_if_changed(self).await
    }

    /// Independent copy of this handle's configuration: no pool, no watcher,
    /// not tied to this handle's future swaps. Stopping it stops whatever
    /// runs on the port it was taken at.
    pub fn snapshot(&self) -> Daemon {
        let current = self.instance();
        Self::from_instance(
            DaemonInstance::stopped(current.config.clone(), current.model.clone()),
            self.shared.controller.clone(),
            Tuning {
                base_port: Some(self.shared.base_port),
                ..self.shared.tuning.clone()
            },
        )
    }

    /// Detach the model watcher so the caller can await its outcome.
    pub fn take_watcher(&self) -> Option<WatcherHandle> {
        self.shared.watcher.lock().expect("watcher lock poisoned").take()
    }

    pub async fn model_changed(&self) -> Result<bool> {
        self.instance().model.has_changed().await
    }

    pub fn instance(&self) -> Arc<DaemonInstance> {
        Arc::clone(&self.shared.current.read().expect("daemon state lock poisoned"))
    }

    pub fn config(&self) -> DaemonConfig {
        self.instance().config.clone()
    }

    pub fn port(&self) -> u16 {
        self.instance().config.port
    }

    pub fn workers(&self) -> usize {
        self.instance().config.workers
    }

    pub fn model(&self) -> ModelRef {
        self.instance().model.clone()
    }

    pub fn pool_capacity(&self) -> usize {
        pool::capacity_for(self.workers())
    }

    pub fn state(&self) -> DaemonState {
        if self.shared.swapping.load(Ordering::SeqCst) {
            DaemonState::Swapping
        } else {
            self.instance().state()
        }
    }

    pub fn tuning(&self) -> &Tuning {
        &self.shared.tuning
    }

    pub(crate) fn base_port(&self) -> u16 {
        self.shared.base_port
    }

    pub(crate) fn controller(&self) -> &ProcessController {
        &self.shared.controller
    }

    pub(crate) async fn lock_lifecycle(&self) -> MutexGuard<'_, ()> {
        self.shared.lifecycle.lock().await
    }

    pub(crate) fn set_swapping(&self, swapping: bool) {
        self.shared.swapping.store(swapping, Ordering::SeqCst);
    }

    /// Repoint the handle at `next`; returns the instance it replaced.
    pub(crate) fn replace(&self, next: Arc<DaemonInstance>) -> Arc<DaemonInstance> {
        let mut current = self
            .shared
            .current
            .write()
            .expect("daemon state lock poisoned");
        std::mem::replace(&mut *current, next)
    }
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("instance", &self.instance())
            .field("state", &self.state())
            .finish()
    }
}

/// Start an instance for `config`, verify it, and connect a pool to it.
pub(crate) async fn launch(
    controller: &ProcessController,
    tuning: &Tuning,
    config: &DaemonConfig,
) -> Result<Arc<ConnectionPool>> {
    let spec = config.launch_spec();
    controller.start(&spec).await?;

    if let Err(e) = controller
        .await_healthy(config.port, config.workers, tuning.start)
        .await
    {
        error!(port = config.port, "Failed to start daemon: {}", e);
        return Err(e);
    }

    info!(port = config.port, workers = config.workers, "Prediction daemon is running");

    ConnectionPool::fill(config.port, pool::capacity_for(config.workers)).await
}
