//! Drain Controller - waits for the agent to finish in-flight work.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, UpdateError};
use crate::poll::{poll_until, PollOutcome};
use crate::session::InstallationState;
use crate::traits::AgentProbe;

/// Default interval between activity polls.
pub const DEFAULT_DRAIN_INTERVAL: Duration = Duration::from_secs(30);

/// Result of waiting for the agent to go idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// A poll observed no work executing.
    Idle,
    /// Work was still executing when `max_wait` elapsed. Nothing was
    /// terminated.
    TimedOut,
}

/// Polls the agent's activity until it is idle. Purely observational.
pub struct DrainController {
    probe: Arc<dyn AgentProbe>,
    interval: Duration,
}

impl DrainController {
    pub fn new(probe: Arc<dyn AgentProbe>, interval: Duration) -> Self {
        Self { probe, interval }
    }

    /// Wait up to `max_wait` for the agent to report no active work.
    ///
    /// A failed probe counts as busy for that poll. Cancellation ends the
    /// wait with [`UpdateError::Cancelled`].
    #[instrument(skip(self, cancel), fields(max_wait_secs = max_wait.as_secs(), interval_secs = self.interval.as_secs()))]
    pub async fn drain(&self, max_wait: Duration, cancel: &CancellationToken) -> Result<DrainOutcome> {
        info!("Waiting for agent to finish in-flight work");

        let probe = &self.probe;
        let outcome = poll_until(
            move || async move {
                match probe.is_busy().await {
                    Ok(busy) => {
                        debug!(busy, "Activity poll");
                        !busy
                    }
                    Err(e) => {
                        warn!(error = %e, "Activity probe failed, treating agent as busy");
                        false
                    }
                }
            },
            self.interval,
            max_wait,
            cancel,
        )
        .await;

        match outcome {
            PollOutcome::Satisfied => {
                info!("Agent is idle");
                Ok(DrainOutcome::Idle)
            }
            PollOutcome::TimedOut => {
                warn!("Agent still busy at drain deadline");
                Ok(DrainOutcome::TimedOut)
            }
            PollOutcome::Cancelled => Err(UpdateError::Cancelled(InstallationState::Draining)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockAgent;

    #[tokio::test]
    async fn test_idle_agent_drains_immediately() {
        let agent = Arc::new(MockAgent::running("1.2.0"));
        let drain = DrainController::new(agent, Duration::from_secs(30));

        let started = std::time::Instant::now();
        let outcome = drain.drain(Duration::from_secs(60), &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, DrainOutcome::Idle);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_busy_agent_times_out_without_interference() {
        let agent = Arc::new(MockAgent::running("1.2.0"));
        agent.set_busy(true);
        let drain = DrainController::new(agent.clone(), Duration::from_millis(10));

        let outcome = drain.drain(Duration::from_millis(60), &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, DrainOutcome::TimedOut);
        assert!(agent.is_running());
        assert_eq!(agent.kill_count(), 0);
    }

    #[tokio::test]
    async fn test_work_finishing_mid_drain() {
        let agent = Arc::new(MockAgent::running("1.2.0"));
        agent.set_busy(true);
        let drain = DrainController::new(agent.clone(), Duration::from_millis(10));

        let finisher = agent.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            finisher.set_busy(false);
        });

        let outcome = drain.drain(Duration::from_secs(5), &CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, DrainOutcome::Idle);
    }

    #[tokio::test]
    async fn test_cancelled_drain() {
        let agent = Arc::new(MockAgent::running("1.2.0"));
        agent.set_busy(true);
        let drain = DrainController::new(agent, Duration::from_millis(10));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = drain.drain(Duration::from_secs(5), &cancel).await.unwrap_err();
        assert!(matches!(err, UpdateError::Cancelled(InstallationState::Draining)));
    }
}
