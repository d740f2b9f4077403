//! Update Orchestrator - drives one update session through the state
//! machine.
//!
//! ```text
//! Idle -> CheckingVersion -> Draining -> BackingUp -> Installing -> Verifying -> Complete
//!              |                 |           |            |             |
//!              +-> Complete      +-----------+------------+ (pre-mutation: back to Idle)
//!                 (up to date)                            |             |
//!                                                         +-> RollingBack -> Failed
//! ```
//!
//! Every transition is persisted to the session marker before the stage
//! runs, so a crashed process leaves enough behind for the next invocation
//! to finish or undo the work.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use semver::Version;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::backup::{BackupManager, Snapshot};
use crate::drain::{DrainController, DrainOutcome, DEFAULT_DRAIN_INTERVAL};
use crate::error::{Result, UpdateError};
use crate::installer::{InstallResult, Installer};
use crate::layout::HostLayout;
use crate::resolver::{Resolution, VersionResolver};
use crate::rollback::RollbackManager;
use crate::service::{ServiceSupervisor, DEFAULT_STOP_GRACE};
use crate::session::{InstallationState, SessionStore, StageRecord, UpdateSession};
use crate::traits::{AgentProbe, ArchiveExtractor, PackageFetcher, ServiceController, ServiceState, VersionSource};
use crate::version::AgentVersion;

/// Default upper bound on the drain wait.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(60 * 60);
/// Default upper bound on the post-start liveness wait.
pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(2 * 60);
/// Default heartbeat age after which a session marker is considered stale.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(6 * 60 * 60);

/// Operator input for one invocation.
#[derive(Debug, Clone)]
pub struct UpdateRequest {
    /// Explicit version to install. `None` means the newest on the channel.
    pub target: Option<Version>,
    /// Proceed past a drain timeout. Together with `target`, also allows
    /// reinstalling or downgrading.
    pub force: bool,
    pub skip_backup: bool,
    pub max_wait: Duration,
    /// Resolve only; change nothing.
    pub dry_run: bool,
}

impl Default for UpdateRequest {
    fn default() -> Self {
        Self {
            target: None,
            force: false,
            skip_backup: false,
            max_wait: DEFAULT_MAX_WAIT,
            dry_run: false,
        }
    }
}

/// Tunables that come from host configuration rather than the operator.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub channel: String,
    pub drain_interval: Duration,
    pub liveness_timeout: Duration,
    pub liveness_interval: Duration,
    pub stop_grace: Duration,
    /// Snapshots kept after a successful backup. `0` disables pruning.
    pub backup_retain: usize,
    pub stale_after: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            channel: "stable".to_string(),
            drain_interval: DEFAULT_DRAIN_INTERVAL,
            liveness_timeout: DEFAULT_LIVENESS_TIMEOUT,
            liveness_interval: Duration::from_secs(2),
            stop_grace: DEFAULT_STOP_GRACE,
            backup_retain: 3,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }
}

/// External mechanisms the orchestrator drives.
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn VersionSource>,
    pub probe: Arc<dyn AgentProbe>,
    pub controller: Arc<dyn ServiceController>,
    pub fetcher: Arc<dyn PackageFetcher>,
    pub extractor: Arc<dyn ArchiveExtractor>,
}

/// How an invocation ended.
#[derive(Debug)]
pub enum UpdateOutcome {
    /// The installed version is already the target.
    UpToDate { current: Version },
    /// The new version is installed and live.
    Complete { from: Version, to: Version },
    /// Dry run: this update would be performed.
    DryRun { current: Version, target: Version },
    /// Failed before the live installation was modified.
    Aborted { error: UpdateError },
    /// Failed after modification and the previous version was restored.
    RolledBack { cause: UpdateError },
    /// Failed after modification and the rollback failed too.
    FatalRollback { cause: UpdateError, rollback: UpdateError },
}

impl UpdateOutcome {
    /// Process exit code for this outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::UpToDate { .. } | Self::Complete { .. } | Self::DryRun { .. } => 0,
            Self::Aborted { .. } | Self::RolledBack { .. } => 1,
            Self::FatalRollback { .. } => 2,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code() == 0
    }
}

impl fmt::Display for UpdateOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UpToDate { current } => write!(f, "up to date at {}", current),
            Self::Complete { from, to } => write!(f, "updated {} -> {}", from, to),
            Self::DryRun { current, target } => write!(f, "dry run: would update {} -> {}", current, target),
            Self::Aborted { error } => write!(f, "aborted: {}", error),
            Self::RolledBack { cause } => write!(f, "rolled back after: {}", cause),
            Self::FatalRollback { cause, rollback } => {
                write!(f, "FATAL: {} (after: {})", rollback, cause)
            }
        }
    }
}

/// Final report of one invocation, including the diagnostic trail.
#[derive(Debug)]
pub struct UpdateReport {
    /// `None` for dry runs, which never create a session.
    pub session_id: Option<Uuid>,
    pub outcome: UpdateOutcome,
    pub final_state: InstallationState,
    pub trail: Vec<StageRecord>,
}

impl UpdateReport {
    pub fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }
}

impl fmt::Display for UpdateReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.session_id {
            Some(id) => writeln!(f, "session {}: {} [{}]", id, self.outcome, self.final_state)?,
            None => writeln!(f, "{} [{}]", self.outcome, self.final_state)?,
        }
        for record in &self.trail {
            writeln!(
                f,
                "  {} {:<16} {}",
                record.at.format("%Y-%m-%dT%H:%M:%SZ"),
                record.stage.to_string(),
                record.outcome
            )?;
        }
        Ok(())
    }
}

enum Preparation {
    UpToDate(Version),
    Ready {
        current: Version,
        target: AgentVersion,
        snapshot: Option<Snapshot>,
    },
}

/// Runs update sessions for one host.
pub struct UpdateOrchestrator {
    layout: HostLayout,
    settings: OrchestratorSettings,
    store: SessionStore,
    resolver: VersionResolver,
    drain: DrainController,
    backups: Arc<BackupManager>,
    installer: Arc<Installer>,
    service: Arc<ServiceSupervisor>,
    rollback: RollbackManager,
    cancel: CancellationToken,
}

impl UpdateOrchestrator {
    pub fn new(
        layout: HostLayout,
        settings: OrchestratorSettings,
        collaborators: Collaborators,
        cancel: CancellationToken,
    ) -> Result<Self> {
        layout.validate()?;

        let store = SessionStore::new(layout.session_file(), settings.stale_after);
        let resolver = VersionResolver::new(
            collaborators.source,
            settings.channel.clone(),
            layout.version_file_path(),
        );
        let drain = DrainController::new(collaborators.probe.clone(), settings.drain_interval);
        let backups = Arc::new(BackupManager::new(
            &layout.install_dir,
            layout.snapshot_root(),
            layout.stateful_files.clone(),
        ));
        let installer = Arc::new(Installer::new(
            layout.clone(),
            collaborators.fetcher,
            collaborators.extractor,
        ));
        let service = Arc::new(
            ServiceSupervisor::new(collaborators.controller, collaborators.probe, settings.stop_grace)
                .with_poll_interval(settings.liveness_interval),
        );
        let rollback = RollbackManager::new(
            backups.clone(),
            installer.clone(),
            service.clone(),
            settings.liveness_timeout,
        );

        Ok(Self {
            layout,
            settings,
            store,
            resolver,
            drain,
            backups,
            installer,
            service,
            rollback,
            cancel,
        })
    }

    pub fn layout(&self) -> &HostLayout {
        &self.layout
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Run one update.
    ///
    /// Returns `Err` only when no session could be started: another session
    /// is active, a previous rollback failed and has not been acknowledged,
    /// or the marker cannot be read or written. Every other failure is an
    /// outcome in the report.
    #[instrument(skip(self), fields(channel = %self.settings.channel))]
    pub async fn run(&self, request: UpdateRequest) -> Result<UpdateReport> {
        if let Some(existing) = self.store.load().await? {
            self.handle_existing(existing, request.dry_run).await?;
        }

        if request.dry_run {
            return Ok(self.dry_run(&request).await);
        }

        let mut session = UpdateSession::new();
        session.forced = request.force;
        self.store.acquire(&mut session).await?;
        info!(session = %session.id, target = ?request.target, force = request.force, "Update session started");

        let outcome = match self.advance(&mut session, InstallationState::CheckingVersion).await {
            Ok(()) => self.execute(&mut session, &request).await,
            Err(e) => self.abort(&mut session, e, false).await,
        };
        Ok(self.finish(session, outcome).await)
    }

    /// Deal with a marker found at startup.
    async fn handle_existing(&self, existing: UpdateSession, dry_run: bool) -> Result<()> {
        if existing.fatal {
            return Err(fatal_marker(&existing));
        }

        if existing.state.is_terminal() {
            info!(session = %existing.id, state = %existing.state, "Removing leftover session marker");
            return self.store.release().await;
        }

        if !self.store.is_stale(&existing) {
            return Err(UpdateError::SessionInProgress {
                session_id: existing.id.to_string(),
                state: existing.state,
                pid: existing.pid,
            });
        }

        if dry_run {
            warn!(session = %existing.id, state = %existing.state, "Stale session marker present, run recover to clear it");
            return Ok(());
        }

        if let Some(report) = self.recover_session(existing).await {
            if let UpdateOutcome::FatalRollback { rollback, .. } = report.outcome {
                return Err(rollback);
            }
        }
        Ok(())
    }

    /// Recover an interrupted session without starting a new one.
    ///
    /// Returns `None` when there was nothing to recover.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<Option<UpdateReport>> {
        if let Err(e) = self.backups.cleanup_staging().await {
            warn!(error = %e, "Failed to clean snapshot staging directories");
        }

        let Some(session) = self.store.load().await? else {
            info!("No session marker, nothing to recover");
            return Ok(None);
        };

        if session.fatal {
            return Err(fatal_marker(&session));
        }

        if !session.state.is_terminal() && !self.store.is_stale(&session) {
            return Err(UpdateError::SessionInProgress {
                session_id: session.id.to_string(),
                state: session.state,
                pid: session.pid,
            });
        }

        Ok(self.recover_session(session).await)
    }

    /// The persisted session, if any.
    pub async fn status(&self) -> Result<Option<UpdateSession>> {
        self.store.load().await
    }

    /// Remove a marker left by a failed rollback once an operator has
    /// repaired the host. Returns whether a marker was cleared.
    pub async fn acknowledge_fatal(&self) -> Result<bool> {
        match self.store.load().await? {
            Some(session) if session.fatal => {
                warn!(session = %session.id, "Operator acknowledged failed rollback, clearing marker");
                self.store.release().await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn recover_session(&self, mut session: UpdateSession) -> Option<UpdateReport> {
        let interrupted = session.state;
        warn!(
            session = %session.id,
            state = %interrupted,
            owner_pid = session.pid,
            "Recovering interrupted session"
        );

        if interrupted.is_terminal() || interrupted == InstallationState::Idle {
            if let Err(e) = self.store.release().await {
                warn!(error = %e, "Failed to remove leftover session marker");
            }
            return None;
        }

        session.pid = std::process::id();
        session.record(format!("interrupted during {}, recovered by pid {}", interrupted, session.pid));

        let outcome = if interrupted.requires_rollback() {
            let cause = UpdateError::PartialInstall(format!("session interrupted during {}", interrupted));
            self.roll_back(&mut session, cause).await
        } else {
            let restart = matches!(self.service.status().await, Ok(ServiceState::Stopped));
            let error = UpdateError::State(format!("session interrupted during {}", interrupted));
            self.abort(&mut session, error, restart).await
        };

        Some(self.finish(session, outcome).await)
    }

    async fn dry_run(&self, request: &UpdateRequest) -> UpdateReport {
        let (outcome, note) = match self.resolver.resolve(request.target.as_ref(), request.force).await {
            Ok(Resolution::AlreadyCurrent { current, available }) => {
                let note = format!("already at {} (available: {})", current, available.number);
                (UpdateOutcome::UpToDate { current }, note)
            }
            Ok(Resolution::Upgrade { current, target }) => {
                let note = format!("would update {} -> {} from {}", current, target.number, target.package);
                (
                    UpdateOutcome::DryRun {
                        current,
                        target: target.number,
                    },
                    note,
                )
            }
            Err(error) => {
                let note = format!("{}: {}", error.kind(), error);
                (UpdateOutcome::Aborted { error }, note)
            }
        };

        info!(outcome = %outcome, "Dry run finished");
        UpdateReport {
            session_id: None,
            outcome,
            final_state: InstallationState::Idle,
            trail: vec![StageRecord {
                stage: InstallationState::CheckingVersion,
                outcome: note,
                at: Utc::now(),
            }],
        }
    }

    async fn execute(&self, session: &mut UpdateSession, request: &UpdateRequest) -> UpdateOutcome {
        let mut agent_stopped = false;
        let (current, target, snapshot) = match self.prepare(session, request, &mut agent_stopped).await {
            Ok(Preparation::UpToDate(current)) => return UpdateOutcome::UpToDate { current },
            Ok(Preparation::Ready {
                current,
                target,
                snapshot,
            }) => (current, target, snapshot),
            Err(e) => return self.abort(session, e, agent_stopped).await,
        };

        // Kept-aside binaries from an earlier update must not be restored by this session.
        if let Err(e) = self.installer.discard_previous().await {
            return self.abort(session, e, agent_stopped).await;
        }
        session.previous_dir = Some(self.layout.previous_dir());
        if let Err(e) = self.advance(session, InstallationState::Installing).await {
            return self.abort(session, e, agent_stopped).await;
        }

        match self.installer.install(&target, snapshot.as_ref()).await {
            InstallResult::Installed { version } => session.record(format!("installed {}", version)),
            InstallResult::Aborted(e) => return self.abort(session, e, agent_stopped).await,
            InstallResult::Partial(e) => return self.roll_back(session, e).await,
        }

        if let Err(e) = self.check_cancelled(InstallationState::Installing) {
            return self.roll_back(session, e).await;
        }

        if let Err(e) = self.advance(session, InstallationState::Verifying).await {
            return self.roll_back(session, e).await;
        }
        if let Err(e) = self.verify(&target).await {
            return self.roll_back(session, e).await;
        }
        session.record(format!("agent live at {}", target.number));

        if let Err(e) = self.advance(session, InstallationState::Complete).await {
            warn!(error = %e, "Failed to persist completion");
        }
        if let Err(e) = self.installer.discard_previous().await {
            warn!(error = %e, "Failed to discard previous binaries");
        }

        UpdateOutcome::Complete {
            from: current,
            to: target.number,
        }
    }

    /// Everything before the live installation is touched.
    async fn prepare(
        &self,
        session: &mut UpdateSession,
        request: &UpdateRequest,
        agent_stopped: &mut bool,
    ) -> Result<Preparation> {
        let (current, target) = match self.resolver.resolve(request.target.as_ref(), request.force).await? {
            Resolution::AlreadyCurrent { current, available } => {
                session.current_version = Some(current.clone());
                session.record(format!("already at {} (available: {})", current, available.number));
                self.advance(session, InstallationState::Complete).await?;
                return Ok(Preparation::UpToDate(current));
            }
            Resolution::Upgrade { current, target } => (current, target),
        };
        session.current_version = Some(current.clone());
        session.target = Some(target.clone());
        session.record(format!("update {} -> {}", current, target.number));
        self.check_cancelled(InstallationState::CheckingVersion)?;

        self.advance(session, InstallationState::Draining).await?;
        let agent_running = self.drain_agent(session, request).await?;
        self.check_cancelled(InstallationState::Draining)?;

        self.advance(session, InstallationState::BackingUp).await?;
        *agent_stopped = agent_running;
        self.service.stop().await?;
        session.record("agent stopped");

        let snapshot = if request.skip_backup {
            warn!("Backup skipped by request");
            session.record("backup skipped by request");
            None
        } else {
            let snapshot = self.backups.create_snapshot().await?;
            session.snapshot = Some(snapshot.id.clone());
            session.record(format!("snapshot {} ({} entries)", snapshot.id, snapshot.files.len()));
            self.prune_snapshots().await;
            Some(snapshot)
        };
        self.store.save(session).await?;
        self.check_cancelled(InstallationState::BackingUp)?;

        Ok(Preparation::Ready {
            current,
            target,
            snapshot,
        })
    }

    /// Returns whether the agent was running when the drain began.
    async fn drain_agent(&self, session: &mut UpdateSession, request: &UpdateRequest) -> Result<bool> {
        match self.service.status().await {
            Ok(ServiceState::Stopped) => {
                session.record("agent not running, drain skipped");
                return Ok(false);
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Service status unavailable, draining anyway"),
        }

        match self.drain.drain(request.max_wait, &self.cancel).await? {
            DrainOutcome::Idle => session.record("agent idle"),
            DrainOutcome::TimedOut if request.force => {
                warn!(max_wait_secs = request.max_wait.as_secs(), "Drain timed out, proceeding because forced");
                session.record(format!(
                    "work still in flight after {}s, proceeding (forced)",
                    request.max_wait.as_secs()
                ));
            }
            DrainOutcome::TimedOut => return Err(UpdateError::DrainTimeout(request.max_wait)),
        }
        Ok(true)
    }

    async fn prune_snapshots(&self) {
        if self.settings.backup_retain == 0 {
            return;
        }
        match self.backups.prune(self.settings.backup_retain).await {
            Ok(0) => {}
            Ok(removed) => info!(removed, retain = self.settings.backup_retain, "Pruned old snapshots"),
            Err(e) => warn!(error = %e, "Failed to prune old snapshots"),
        }
    }

    async fn verify(&self, target: &AgentVersion) -> Result<()> {
        self.service
            .start()
            .await
            .map_err(|e| UpdateError::ServiceStartFailure(format!("start request failed: {}", e)))?;

        if !self.service.wait_for_liveness(self.settings.liveness_timeout).await {
            return Err(UpdateError::ServiceStartFailure(format!(
                "agent not live within {}s",
                self.settings.liveness_timeout.as_secs()
            )));
        }

        match self.service.running_version().await {
            Some(running) if running == target.number => Ok(()),
            running => Err(UpdateError::ServiceStartFailure(format!(
                "agent reports version {} instead of {}",
                running.map(|v| v.to_string()).unwrap_or_else(|| "unknown".to_string()),
                target.number
            ))),
        }
    }

    /// Discard the session after a pre-mutation failure.
    async fn abort(&self, session: &mut UpdateSession, error: UpdateError, restart_agent: bool) -> UpdateOutcome {
        warn!(stage = %session.state, error = %error, "Update aborted before modifying the installation");
        session.record(format!("{}: {}", error.kind(), error));

        if restart_agent {
            match self.service.start().await {
                Ok(()) => session.record("agent restarted"),
                Err(e) => {
                    error!(error = %e, "Failed to restart agent after abort");
                    session.record(format!("failed to restart agent: {}", e));
                }
            }
        }

        if let Err(e) = session.transition(InstallationState::Idle) {
            warn!(error = %e, "Session could not return to idle");
        }
        UpdateOutcome::Aborted { error }
    }

    async fn roll_back(&self, session: &mut UpdateSession, cause: UpdateError) -> UpdateOutcome {
        error!(stage = %session.state, error = %cause, "Update failed after modifying the installation");
        session.record(format!("{}: {}", cause.kind(), cause));

        if session.state != InstallationState::RollingBack {
            if let Err(e) = self.advance(session, InstallationState::RollingBack).await {
                warn!(error = %e, "Failed to persist rollback start");
            }
        }

        let outcome = match self.rollback.rollback(session).await {
            Ok(()) => {
                session.record(format!(
                    "restored {}",
                    session
                        .current_version
                        .as_ref()
                        .map(|v| v.to_string())
                        .unwrap_or_else(|| "previous version".to_string())
                ));
                UpdateOutcome::RolledBack { cause }
            }
            Err(rollback) => {
                error!(error = %rollback, "Rollback failed, manual intervention required");
                session.fatal = true;
                session.record(format!("{}: {}", rollback.kind(), rollback));
                UpdateOutcome::FatalRollback { cause, rollback }
            }
        };

        if let Err(e) = session.transition(InstallationState::Failed) {
            warn!(error = %e, "Session could not be marked failed");
        }
        outcome
    }

    async fn finish(&self, mut session: UpdateSession, outcome: UpdateOutcome) -> UpdateReport {
        if let Err(e) = self.store.save(&mut session).await {
            warn!(error = %e, "Failed to persist final session state");
        }

        if session.fatal {
            error!(path = %self.store.path().display(), "Session marker kept until an operator acknowledges the failed rollback");
        } else if let Err(e) = self.store.release().await {
            warn!(error = %e, "Failed to release session marker");
        }

        let report = UpdateReport {
            session_id: Some(session.id),
            outcome,
            final_state: session.state,
            trail: session.trail,
        };

        match report.exit_code() {
            0 => info!(session = %session.id, outcome = %report.outcome, "Update session finished"),
            1 => warn!(session = %session.id, outcome = %report.outcome, "Update session finished"),
            _ => error!(session = %session.id, outcome = %report.outcome, "Update session finished"),
        }
        report
    }

    async fn advance(&self, session: &mut UpdateSession, next: InstallationState) -> Result<()> {
        session.transition(next)?;
        self.store.save(session).await
    }

    fn check_cancelled(&self, stage: InstallationState) -> Result<()> {
        if self.cancel.is_cancelled() {
            warn!(stage = %stage, "Cancellation requested");
            return Err(UpdateError::Cancelled(stage));
        }
        Ok(())
    }
}

fn fatal_marker(session: &UpdateSession) -> UpdateError {
    UpdateError::FatalRollback(format!(
        "session {} failed to roll back at {}; repair the host and run `recover --acknowledge`",
        session.id,
        session.updated_at.format("%Y-%m-%dT%H:%M:%SZ")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let v = Version::new(1, 2, 0);
        assert_eq!(UpdateOutcome::UpToDate { current: v.clone() }.exit_code(), 0);
        assert_eq!(
            UpdateOutcome::DryRun {
                current: v.clone(),
                target: Version::new(1, 3, 0)
            }
            .exit_code(),
            0
        );
        assert_eq!(
            UpdateOutcome::Aborted {
                error: UpdateError::DrainTimeout(Duration::from_secs(1))
            }
            .exit_code(),
            1
        );
        let fatal = UpdateOutcome::FatalRollback {
            cause: UpdateError::ServiceStartFailure("not live".into()),
            rollback: UpdateError::FatalRollback("previous binaries missing".into()),
        };
        assert_eq!(fatal.exit_code(), 2);
        assert!(!fatal.is_success());
        assert!(fatal.to_string().starts_with("FATAL"));
    }

    #[test]
    fn test_report_lists_trail() {
        let report = UpdateReport {
            session_id: None,
            outcome: UpdateOutcome::Complete {
                from: Version::new(1, 2, 0),
                to: Version::new(1, 3, 0),
            },
            final_state: InstallationState::Complete,
            trail: vec![StageRecord {
                stage: InstallationState::Draining,
                outcome: "agent idle".to_string(),
                at: Utc::now(),
            }],
        };
        let text = report.to_string();
        assert!(text.contains("updated 1.2.0 -> 1.3.0"));
        assert!(text.contains("draining"));
        assert!(text.contains("agent idle"));
    }
}
