//! Hot reload: bring up a replacement instance on the alternate port, swap
//! it into the handle, then retire the old one.

use super::handle::{self, Daemon, DaemonConfig, DaemonInstance};
use super::model::ModelRef;
use crate::error::{DaemonError, Result};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Two-port rotation: the base port and the one above it.
pub fn alternate_port(current: u16, base: u16) -> u16 {
    if current == base {
        base + 1
    } else {
        base
    }
}

struct SwapGuard<'a>(&'a Daemon);

impl<'a> SwapGuard<'a> {
    fn enter(daemon: &'a Daemon) -> Self {
        daemon.set_swapping(true);
        Self(daemon)
    }
}

impl Drop for SwapGuard<'_> {
    fn drop(&mut self) {
        self.0.set_swapping(false);
    }
}

/// Replace the handle's instance with a fresh one running the current model.
///
/// On failure the handle keeps pointing at the old instance, which is left
/// running, and the half-started replacement is torn down.
pub async fn recreate(daemon: &Daemon) -> Result<()> {
    let _lifecycle = daemon.lock_lifecycle().await;
    swap(daemon).await
}

/// Recreate only if the model is still stale once the lifecycle lock is held,
/// so a change already picked up by a concurrent reload is not applied twice.
/// Returns whether a reload ran.
pub async fn reload_if_changed(daemon: &Daemon) -> Result<bool> {
    let _lifecycle = daemon.lock_lifecycle().await;
    if !daemon.model_changed().await? {
        return Ok(false);
    }

    info!(path = %daemon.model().path.display(), "Model artifact changed, reloading daemon");
    swap(daemon).await?;
    Ok(true)
}

async fn swap(daemon: &Daemon) -> Result<()> {
    let _swapping = SwapGuard::enter(daemon);

    let drain = daemon.snapshot();
    let current = daemon.instance();
    let from = current.config().port;
    let to = alternate_port(from, daemon.base_port());
    let next_config = DaemonConfig {
        port: to,
        ..current.config().clone()
    };

    info!(from, to, "Hot reload: starting replacement daemon");

    let next = match build_replacement(daemon, next_config).await {
        Ok(next) => next,
        Err(e) => {
            error!(from, to, "Hot reload failed: {}", e);
            if let Err(stop_err) = daemon.controller().stop(to).await {
                warn!(port = to, "Failed to clean up replacement daemon: {}", stop_err);
            }
            return Err(DaemonError::SwapFailed {
                port: to,
                source: Box::new(e),
            });
        }
    };

    let previous = daemon.replace(Arc::new(next));
    info!(port = to, "Hot reload: replacement daemon is live");

    if let Some(pool) = previous.pool() {
        if !pool.drain(daemon.tuning().drain_timeout).await {
            warn!(port = from, in_use = pool.in_use(), "Retiring pool with requests in flight");
        }
        pool.close();
    }

    drain.stop().await?;
    info!(from, to, "Hot reload complete");
    Ok(())
}

async fn build_replacement(daemon: &Daemon, config: DaemonConfig) -> Result<DaemonInstance> {
    // Stat before launch: this timestamp becomes the stored one only if the swap commits.
    let model = ModelRef::stat(&config.model, config.updatable).await?;
    let pool = handle::launch(daemon.controller(), daemon.tuning(), &config).await?;
    Ok(DaemonInstance::running(config, model, pool))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::health::HealthPolicy;
    use crate::daemon::protocol::DaemonState;
    use crate::daemon::testing::{model_file, touch, FakeEngine};
    use crate::daemon::Tuning;
    use std::time::{Duration, Instant};

    fn tuning() -> Tuning {
        Tuning {
            start: HealthPolicy::new(3, Duration::from_millis(5)),
            stop: HealthPolicy::new(3, Duration::from_millis(5)),
            watch_interval: Duration::from_secs(60),
            checkout_timeout: Some(Duration::from_secs(2)),
            drain_timeout: Duration::from_millis(100),
            base_port: None,
        }
    }

    #[test]
    fn rotation_uses_two_ports() {
        assert_eq!(alternate_port(26542, 26542), 26543);
        assert_eq!(alternate_port(26543, 26542), 26542);
        assert_eq!(alternate_port(30000, 26542), 26542);
    }

    #[tokio::test]
    async fn recreate_alternates_ports_in_place() {
        let (_dir, model) = model_file();
        let engine = FakeEngine::new();
        let daemon = Daemon::new(
            DaemonConfig::new("vw", model).port(41_200).workers(4),
            engine.clone(),
            tuning(),
        )
        .await
        .unwrap();
        let held = daemon.clone();
        daemon.run().await.unwrap();

        daemon.recreate().await.unwrap();
        assert_eq!(held.port(), 41_201);
        assert_eq!(held.workers(), 4);
        assert_eq!(held.state(), DaemonState::Running);
        assert_eq!(engine.count_now(41_200), 0);
        assert_eq!(engine.count_now(41_201), 5);
        held.predict(b"1 |f a:1").await.unwrap();

        daemon.recreate().await.unwrap();
        assert_eq!(held.port(), 41_200);
        assert_eq!(engine.count_now(41_201), 0);
        held.predict(b"1 |f a:1").await.unwrap();

        daemon.stop().await.unwrap();
    }

    #[tokio::test]
    async fn recreate_refreshes_model_timestamp() {
        let (_dir, model) = model_file();
        let daemon = Daemon::new(
            DaemonConfig::new("vw", &model).port(41_210),
            FakeEngine::new(),
            tuning(),
        )
        .await
        .unwrap();
        daemon.run().await.unwrap();

        touch(&model, Duration::from_secs(30));
        let before = daemon.model().modified;
        assert!(daemon.model_changed().await.unwrap());

        daemon.recreate().await.unwrap();
        assert_ne!(daemon.model().modified, before);
        assert!(!daemon.model_changed().await.unwrap());

        daemon.stop().await.unwrap();
    }

    #[tokio::test]
    async fn failed_swap_keeps_old_instance() {
        let (_dir, model) = model_file();
        let engine = FakeEngine::new();
        let daemon = Daemon::new(
            DaemonConfig::new("vw", &model).port(41_220),
            engine.clone(),
            tuning(),
        )
        .await
        .unwrap();
        daemon.run().await.unwrap();

        touch(&model, Duration::from_secs(30));
        let stale = daemon.model().modified;
        engine.partial_start(41_221, 1);

        let err = daemon.recreate().await.unwrap_err();
        assert!(matches!(err, DaemonError::SwapFailed { port: 41_221, .. }));

        assert_eq!(daemon.port(), 41_220);
        assert_eq!(daemon.model().modified, stale);
        assert_eq!(daemon.state(), DaemonState::Running);
        assert_eq!(engine.count_now(41_221), 0);
        daemon.predict(b"still serving").await.unwrap();

        daemon.stop().await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_reloads_apply_one_change_once() {
        let (_dir, model) = model_file();
        let engine = FakeEngine::new();
        let daemon = Daemon::new(
            DaemonConfig::new("vw", &model).port(41_240),
            engine.clone(),
            tuning(),
        )
        .await
        .unwrap();
        daemon.run().await.unwrap();
        assert!(!daemon.reload_if_changed().await.unwrap());

        touch(&model, Duration::from_secs(30));
        let (a, b) = tokio::join!(daemon.reload_if_changed(), daemon.reload_if_changed());
        let reloads = [a.unwrap(), b.unwrap()].iter().filter(|r| **r).count();

        assert_eq!(reloads, 1);
        assert_eq!(daemon.port(), 41_241);
        assert_eq!(engine.launches(41_241), 1);
        assert_eq!(engine.launches(41_240), 1);

        daemon.stop().await.unwrap();
    }

    #[tokio::test]
    async fn held_checkout_bounds_drain_and_shows_swapping() {
        let (_dir, model) = model_file();
        let engine = FakeEngine::new();
        let drain_timeout = Duration::from_millis(300);
        let daemon = Daemon::new(
            DaemonConfig::new("vw", model).port(41_250),
            engine.clone(),
            Tuning {
                drain_timeout,
                ..tuning()
            },
        )
        .await
        .unwrap();
        daemon.run().await.unwrap();

        let stale = daemon.instance();
        let held = stale.pool().unwrap().checkout(None).await.unwrap();

        let swapper = daemon.clone();
        let reload = tokio::spawn(async move {
            let started = Instant::now();
            swapper.recreate().await.map(|_| started.elapsed())
        });

        let mut saw_swapping = false;
        for _ in 0..100 {
            if daemon.state() == DaemonState::Swapping {
                saw_swapping = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(saw_swapping);

        let elapsed = reload.await.unwrap().unwrap();
        assert!(elapsed >= drain_timeout);
        assert!(elapsed < drain_timeout + Duration::from_secs(1));
        assert_eq!(daemon.state(), DaemonState::Running);
        assert_eq!(daemon.port(), 41_251);
        assert!(stale.pool().unwrap().is_closed());
        drop(held);

        // The holder that loaded the retired instance is served by the new one.
        daemon.predict_from(stale, b"1 |f a:1").await.unwrap();
        assert_eq!(engine.received(41_251), vec!["1 |f a:1\n"]);

        daemon.stop().await.unwrap();
    }

    #[tokio::test]
    async fn explicit_base_port_anchors_rotation() {
        let (_dir, model) = model_file();
        let daemon = Daemon::new(
            DaemonConfig::new("vw", model).port(41_235),
            FakeEngine::new(),
            Tuning {
                base_port: Some(41_230),
                ..tuning()
            },
        )
        .await
        .unwrap();
        daemon.run().await.unwrap();

        daemon.recreate().await.unwrap();
        assert_eq!(daemon.port(), 41_230);
        daemon.recreate().await.unwrap();
        assert_eq!(daemon.port(), 41_231);

        daemon.stop().await.unwrap();
    }
}
