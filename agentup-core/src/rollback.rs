//! Rollback Manager - returns the host to the version and state it had
//! before the session started.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, instrument, warn};

use crate::backup::BackupManager;
use crate::error::{Result, UpdateError};
use crate::installer::{Installer, PreviousRestore};
use crate::service::ServiceSupervisor;
use crate::session::UpdateSession;

pub struct RollbackManager {
    backups: Arc<BackupManager>,
    installer: Arc<Installer>,
    service: Arc<ServiceSupervisor>,
    liveness_timeout: Duration,
}

impl RollbackManager {
    pub fn new(
        backups: Arc<BackupManager>,
        installer: Arc<Installer>,
        service: Arc<ServiceSupervisor>,
        liveness_timeout: Duration,
    ) -> Self {
        Self {
            backups,
            installer,
            service,
            liveness_timeout,
        }
    }

    /// Restore the previous binaries and the session's snapshot, restart the
    /// agent, and confirm it runs the pre-update version.
    ///
    /// Any failure here is [`UpdateError::FatalRollback`].
    #[instrument(skip(self, session), fields(session = %session.id))]
    pub async fn rollback(&self, session: &UpdateSession) -> Result<()> {
        warn!(
            from = ?session.target.as_ref().map(|t| t.number.to_string()),
            to = ?session.current_version.as_ref().map(|v| v.to_string()),
            "Rolling back"
        );

        self.service
            .stop()
            .await
            .map_err(|e| fatal("failed to stop agent", e))?;

        if let Some(id) = &session.snapshot {
            let snapshot = self
                .backups
                .load(id)
                .await
                .map_err(|e| fatal("snapshot unavailable", e))?;
            self.backups
                .restore(&snapshot)
                .await
                .map_err(|e| fatal("failed to restore stateful files", e))?;
            info!(snapshot = %id, "Stateful files restored");
        } else {
            warn!("Session has no snapshot, stateful files left as they are");
        }

        match self.installer.restore_previous(session.current_version.as_ref()).await {
            Ok(PreviousRestore::Restored) => info!("Previous binaries restored"),
            Ok(PreviousRestore::NothingKept) => info!("Live binaries were never replaced"),
            Err(e) => return Err(fatal("failed to restore previous binaries", e)),
        }

        self.service
            .start()
            .await
            .map_err(|e| fatal("failed to restart agent", e))?;

        if !self.service.wait_for_liveness(self.liveness_timeout).await {
            error!(timeout_secs = self.liveness_timeout.as_secs(), "Agent did not become live after rollback");
            return Err(UpdateError::FatalRollback(format!(
                "agent not live within {}s after rollback",
                self.liveness_timeout.as_secs()
            )));
        }

        if let Some(expected) = &session.current_version {
            let running = self.service.running_version().await;
            if running.as_ref() != Some(expected) {
                return Err(UpdateError::FatalRollback(format!(
                    "agent runs {} after rollback, expected {}",
                    running.map(|v| v.to_string()).unwrap_or_else(|| "unknown".to_string()),
                    expected
                )));
            }
        }

        info!("Rollback complete");
        Ok(())
    }
}

fn fatal(context: &str, e: UpdateError) -> UpdateError {
    match e {
        UpdateError::FatalRollback(_) => e,
        other => UpdateError::FatalRollback(format!("{}: {}", context, other)),
    }
}
