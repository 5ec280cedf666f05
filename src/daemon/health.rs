use super::process::ProcessControl;
use crate::error::Result;
use std::time::Duration;
use tracing::{debug, trace};

/// Default budget while waiting for a freshly launched daemon
pub const START_POLICY: HealthPolicy = HealthPolicy::new(5, Duration::from_millis(500));

/// Default budget while waiting for a killed daemon to disappear
pub const STOP_POLICY: HealthPolicy = HealthPolicy::new(5, Duration::from_millis(500));

/// Bounded polling budget: `tries` queries with `delay` between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthPolicy {
    pub tries: u32,
    pub delay: Duration,
}

impl HealthPolicy {
    pub const fn new(tries: u32, delay: Duration) -> Self {
        Self { tries, delay }
    }
}

/// Outcome of a polling run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOutcome {
    pub reached: bool,
    pub observed: usize,
    pub polls: u32,
}

/// Poll the process count on `port` until it equals `target`.
///
/// Sleeps only between attempts. A failing count query aborts the poll.
/// The count is always queried at least once, even with `tries == 0`.
pub async fn poll_count(
    control: &dyn ProcessControl,
    port: u16,
    target: usize,
    policy: HealthPolicy,
) -> Result<PollOutcome> {
    let tries = policy.tries.max(1);
    let mut observed = 0;

    for attempt in 1..=tries {
        observed = control.count(port).await?;
        trace!(port, attempt, observed, target, "Process count poll");

        if observed == target {
            debug!(port, attempt, observed, "Process count reached target");
            return Ok(PollOutcome {
                reached: true,
                observed,
                polls: attempt,
            });
        }

        if attempt < tries {
            tokio::time::sleep(policy.delay).await;
        }
    }

    Ok(PollOutcome {
        reached: false,
        observed,
        polls: tries,
    })
}

/// Total processes a healthy daemon shows: every worker plus the parent.
pub fn expected_processes(workers: usize) -> usize {
    workers + 1
}
