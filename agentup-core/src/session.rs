//! Update session record and its persisted marker.
//!
//! The marker file doubles as the per-host lock: it is created with
//! exclusive-create semantics when a session begins, rewritten atomically
//! after every transition, and removed once the session reaches a terminal
//! state. A marker left behind by a crashed process is detected as stale and
//! recovered by the next invocation.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, UpdateError};
use crate::fsutil::write_atomic;
use crate::version::AgentVersion;

/// Stage of an update session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallationState {
    Idle,
    CheckingVersion,
    Draining,
    BackingUp,
    Installing,
    Verifying,
    RollingBack,
    Complete,
    Failed,
}

impl InstallationState {
    /// States in which a new session may begin.
    pub fn can_begin_session(self) -> bool {
        matches!(self, Self::Idle | Self::Complete | Self::Failed)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    /// Whether the live installation may have been modified in this state,
    /// so an interrupted session must be rolled back.
    pub fn requires_rollback(self) -> bool {
        matches!(self, Self::Installing | Self::Verifying | Self::RollingBack)
    }

    /// Allowed forward transitions.
    ///
    /// `CheckingVersion -> Complete` covers the already-current case, and
    /// the pre-mutation states fall back to `Idle` when a session is
    /// discarded.
    pub fn can_transition_to(self, next: InstallationState) -> bool {
        use InstallationState::*;
        matches!(
            (self, next),
            (Idle | Complete | Failed, CheckingVersion)
                | (CheckingVersion, Draining | Complete | Idle)
                | (Draining, BackingUp | Idle)
                | (BackingUp, Installing | Idle)
                | (Installing, Verifying | RollingBack | Idle)
                | (Verifying, Complete | RollingBack)
                | (RollingBack, Failed)
        )
    }
}

impl fmt::Display for InstallationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::CheckingVersion => "checking_version",
            Self::Draining => "draining",
            Self::BackingUp => "backing_up",
            Self::Installing => "installing",
            Self::Verifying => "verifying",
            Self::RollingBack => "rolling_back",
            Self::Complete => "complete",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One entry of the diagnostic trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: InstallationState,
    pub outcome: String,
    pub at: DateTime<Utc>,
}

/// The single mutable record describing one update attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateSession {
    pub id: Uuid,
    /// Process that owns the session.
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    /// Heartbeat, bumped on every save.
    pub updated_at: DateTime<Utc>,
    pub state: InstallationState,
    #[serde(default)]
    pub current_version: Option<Version>,
    #[serde(default)]
    pub target: Option<AgentVersion>,
    #[serde(default)]
    pub forced: bool,
    /// Id of the backup snapshot taken for this session.
    #[serde(default)]
    pub snapshot: Option<String>,
    /// Where the previous binaries were kept aside.
    #[serde(default)]
    pub previous_dir: Option<PathBuf>,
    /// Set when rollback failed; the marker is then kept until an operator
    /// acknowledges it.
    #[serde(default)]
    pub fatal: bool,
    #[serde(default)]
    pub trail: Vec<StageRecord>,
}

impl UpdateSession {
    /// New session owned by the current process.
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            pid: std::process::id(),
            started_at: now,
            updated_at: now,
            state: InstallationState::Idle,
            current_version: None,
            target: None,
            forced: false,
            snapshot: None,
            previous_dir: None,
            fatal: false,
            trail: Vec::new(),
        }
    }

    /// Move to `next`, rejecting transitions the state machine does not
    /// allow.
    pub fn transition(&mut self, next: InstallationState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(UpdateError::State(format!(
                "invalid transition {} -> {}",
                self.state, next
            )));
        }
        debug!(session = %self.id, from = %self.state, to = %next, "Session transition");
        self.state = next;
        Ok(())
    }

    /// Append an outcome for the current stage to the trail.
    pub fn record(&mut self, outcome: impl Into<String>) {
        let outcome = outcome.into();
        info!(session = %self.id, stage = %self.state, outcome = %outcome, "Stage outcome");
        self.trail.push(StageRecord {
            stage: self.state,
            outcome,
            at: Utc::now(),
        });
    }

    /// Whether the session is still moving through the state machine.
    pub fn is_active(&self) -> bool {
        !self.state.can_begin_session()
    }
}

impl Default for UpdateSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Persists the session marker.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
    stale_after: Duration,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>, stale_after: Duration) -> Self {
        Self {
            path: path.into(),
            stale_after,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the marker for `session`. Fails with
    /// [`UpdateError::SessionInProgress`] if any marker already exists.
    pub async fn acquire(&self, session: &mut UpdateSession) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| state_err("create state directory", &self.path, e))?;
        }

        session.updated_at = Utc::now();
        let json = encode(session)?;

        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                let holder = self.load().await?;
                return Err(match holder {
                    Some(holder) => UpdateError::SessionInProgress {
                        session_id: holder.id.to_string(),
                        state: holder.state,
                        pid: holder.pid,
                    },
                    None => UpdateError::State(format!(
                        "session marker {} appeared and vanished while acquiring",
                        self.path.display()
                    )),
                });
            }
            Err(e) => return Err(state_err("create session marker", &self.path, e)),
        };

        file.write_all(&json)
            .await
            .map_err(|e| state_err("write session marker", &self.path, e))?;
        file.sync_all()
            .await
            .map_err(|e| state_err("sync session marker", &self.path, e))?;

        info!(session = %session.id, path = %self.path.display(), "Session marker acquired");
        Ok(())
    }

    /// Rewrite the marker with the current session contents.
    pub async fn save(&self, session: &mut UpdateSession) -> Result<()> {
        session.updated_at = Utc::now();
        let json = encode(session)?;
        write_atomic(&self.path, &json)
            .await
            .map_err(|e| state_err("write session marker", &self.path, e))
    }

    /// Read the marker, if one exists.
    pub async fn load(&self) -> Result<Option<UpdateSession>> {
        let content = match fs::read(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(state_err("read session marker", &self.path, e)),
        };

        serde_json::from_slice(&content).map(Some).map_err(|e| {
            UpdateError::State(format!(
                "session marker {} is corrupt: {}",
                self.path.display(),
                e
            ))
        })
    }

    /// Remove the marker.
    pub async fn release(&self) -> Result<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!(path = %self.path.display(), "Session marker released");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(state_err("remove session marker", &self.path, e)),
        }
    }

    /// A marker is stale once its owning process is gone or its heartbeat
    /// is older than `stale_after`.
    pub fn is_stale(&self, session: &UpdateSession) -> bool {
        if !process_alive(session.pid) {
            warn!(session = %session.id, pid = session.pid, "Session owner is no longer running");
            return true;
        }

        let age = Utc::now().signed_duration_since(session.updated_at);
        let stale = age.to_std().map(|age| age > self.stale_after).unwrap_or(false);
        if stale {
            warn!(
                session = %session.id,
                age_secs = age.num_seconds(),
                "Session heartbeat is stale"
            );
        }
        stale
    }
}

fn encode(session: &UpdateSession) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(session)
        .map_err(|e| UpdateError::State(format!("failed to encode session: {}", e)))
}

fn state_err(action: &str, path: &Path, e: io::Error) -> UpdateError {
    UpdateError::State(format!("failed to {} {}: {}", action, path.display(), e))
}

/// Whether a process with `pid` exists on this host.
#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    if pid == std::process::id() {
        return true;
    }
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }

    // Signal 0 performs the permission and existence checks only.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    // Without a liveness check only the heartbeat decides staleness.
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Far above any real pid_max, so never a live process.
    const DEAD_PID: u32 = i32::MAX as u32;

    #[test]
    fn test_state_machine_transitions() {
        use InstallationState::*;
        assert!(Idle.can_transition_to(CheckingVersion));
        assert!(CheckingVersion.can_transition_to(Complete));
        assert!(Installing.can_transition_to(RollingBack));
        assert!(Verifying.can_transition_to(RollingBack));
        assert!(RollingBack.can_transition_to(Failed));

        assert!(!Draining.can_transition_to(RollingBack));
        assert!(!BackingUp.can_transition_to(RollingBack));
        assert!(!RollingBack.can_transition_to(Complete));
        assert!(!Verifying.can_transition_to(Idle));
        assert!(!Installing.can_transition_to(CheckingVersion));
    }

    #[test]
    fn test_session_transition_and_trail() {
        let mut session = UpdateSession::new();
        session.transition(InstallationState::CheckingVersion).unwrap();
        session.record("upgrade 1.2.0 -> 1.3.0");
        assert!(session.is_active());
        assert!(session.transition(InstallationState::Verifying).is_err());
        assert_eq!(session.state, InstallationState::CheckingVersion);
        assert_eq!(session.trail.len(), 1);
        assert_eq!(session.trail[0].stage, InstallationState::CheckingVersion);
    }

    #[tokio::test]
    async fn test_acquire_is_exclusive() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path().join("session.json"), Duration::from_secs(3600));

        let mut first = UpdateSession::new();
        first.transition(InstallationState::CheckingVersion).unwrap();
        store.acquire(&mut first).await.unwrap();

        let mut second = UpdateSession::new();
        let err = store.acquire(&mut second).await.unwrap_err();
        match err {
            UpdateError::SessionInProgress { session_id, state, .. } => {
                assert_eq!(session_id, first.id.to_string());
                assert_eq!(state, InstallationState::CheckingVersion);
            }
            other => panic!("unexpected error: {other}"),
        }

        store.release().await.unwrap();
        store.acquire(&mut second).await.unwrap();
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path().join("session.json"), Duration::from_secs(3600));
        assert!(store.load().await.unwrap().is_none());

        let mut session = UpdateSession::new();
        store.acquire(&mut session).await.unwrap();
        session.transition(InstallationState::CheckingVersion).unwrap();
        session.snapshot = Some("20260101T000000.000Z-abcd".to_string());
        store.save(&mut session).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.id, session.id);
        assert_eq!(loaded.state, InstallationState::CheckingVersion);
        assert_eq!(loaded.snapshot, session.snapshot);
    }

    #[tokio::test]
    async fn test_corrupt_marker_is_state_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("session.json");
        fs::write(&path, b"{not json").await.unwrap();
        let store = SessionStore::new(path, Duration::from_secs(3600));
        assert!(matches!(store.load().await, Err(UpdateError::State(_))));
    }

    #[test]
    fn test_staleness() {
        let store = SessionStore::new("/unused", Duration::from_secs(60));

        let live = UpdateSession::new();
        assert!(!store.is_stale(&live));

        if cfg!(unix) {
            let mut orphaned = UpdateSession::new();
            orphaned.pid = DEAD_PID;
            assert!(store.is_stale(&orphaned));
        }

        let mut silent = UpdateSession::new();
        silent.updated_at = Utc::now() - chrono::Duration::minutes(5);
        assert!(store.is_stale(&silent));
    }
}
