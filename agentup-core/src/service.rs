//! Service supervision: bounded stop, start, and liveness waits on top of a
//! [`ServiceController`].

use std::sync::Arc;
use std::time::Duration;

use semver::Version;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, UpdateError};
use crate::poll::{poll_until, PollOutcome};
use crate::traits::{AgentProbe, ServiceController, ServiceState};

/// Default time a graceful stop is given before the process is killed.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(30);

const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct ServiceSupervisor {
    controller: Arc<dyn ServiceController>,
    probe: Arc<dyn AgentProbe>,
    stop_grace: Duration,
    poll_interval: Duration,
}

impl ServiceSupervisor {
    pub fn new(controller: Arc<dyn ServiceController>, probe: Arc<dyn AgentProbe>, stop_grace: Duration) -> Self {
        Self {
            controller,
            probe,
            stop_grace,
            poll_interval: STATUS_POLL_INTERVAL,
        }
    }

    /// Override the interval used for status and liveness polls.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn name(&self) -> &str {
        self.controller.name()
    }

    pub async fn status(&self) -> Result<ServiceState> {
        self.controller.status().await
    }

    /// Stop the agent and wait until the service manager reports it stopped.
    ///
    /// Escalates to a kill once `stop_grace` expires.
    #[instrument(skip(self), fields(service = %self.controller.name()))]
    pub async fn stop(&self) -> Result<()> {
        if self.status().await? == ServiceState::Stopped {
            debug!("Service already stopped");
            return Ok(());
        }

        info!("Stopping service");
        self.controller.stop().await?;
        if self.wait_for_stopped(self.stop_grace).await {
            info!("Service stopped");
            return Ok(());
        }

        warn!(grace_secs = self.stop_grace.as_secs(), "Service ignored graceful stop, killing");
        self.controller.kill().await?;
        if self.wait_for_stopped(self.stop_grace).await {
            info!("Service killed");
            return Ok(());
        }

        Err(UpdateError::ServiceControl(format!(
            "{} still running after kill",
            self.controller.name()
        )))
    }

    async fn wait_for_stopped(&self, timeout: Duration) -> bool {
        let controller = &self.controller;
        let outcome = poll_until(
            move || async move { matches!(controller.status().await, Ok(ServiceState::Stopped)) },
            self.poll_interval,
            timeout,
            &CancellationToken::new(),
        )
        .await;
        outcome == PollOutcome::Satisfied
    }

    #[instrument(skip(self), fields(service = %self.controller.name()))]
    pub async fn start(&self) -> Result<()> {
        info!("Starting service");
        self.controller.start().await
    }

    /// Wait up to `timeout` for the agent to report itself healthy.
    ///
    /// Never cancelled: once the live installation has been touched the
    /// outcome must be known before the session can end.
    pub async fn wait_for_liveness(&self, timeout: Duration) -> bool {
        let probe = &self.probe;
        let outcome = poll_until(
            move || async move {
                match probe.health().await {
                    Ok(health) => health.healthy,
                    Err(e) => {
                        debug!(error = %e, "Health probe failed");
                        false
                    }
                }
            },
            self.poll_interval,
            timeout,
            &CancellationToken::new(),
        )
        .await;
        outcome == PollOutcome::Satisfied
    }

    /// Version the running agent reports, if it is up and reports one.
    pub async fn running_version(&self) -> Option<Version> {
        match self.probe.health().await {
            Ok(health) if health.healthy => health.version,
            Ok(_) => None,
            Err(e) => {
                debug!(error = %e, "Health probe failed");
                None
            }
        }
    }
}
