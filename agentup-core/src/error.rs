//! Error types for the update orchestrator.

use std::time::Duration;

use thiserror::Error;

use crate::session::InstallationState;

/// Errors that can occur while updating the managed agent.
///
/// Variants up to and including [`UpdateError::Extraction`] are raised before
/// any destructive change to the live installation. [`UpdateError::PartialInstall`]
/// and [`UpdateError::ServiceStartFailure`] are raised after the swap and
/// trigger a rollback.
#[derive(Error, Debug)]
pub enum UpdateError {
    /// The version source was unreachable or returned malformed metadata.
    #[error("Failed to resolve version: {0}")]
    Resolution(String),

    /// Another update session holds the session marker.
    #[error("Update session {session_id} already in progress (state: {state}, pid: {pid})")]
    SessionInProgress {
        session_id: String,
        state: InstallationState,
        pid: u32,
    },

    /// The agent still had work in flight when the drain timeout expired.
    #[error("Agent did not drain within {}s", .0.as_secs())]
    DrainTimeout(Duration),

    /// Snapshot creation failed.
    #[error("Backup failed: {0}")]
    Backup(String),

    /// The package could not be downloaded.
    #[error("Download failed: {0}")]
    Download(String),

    /// The downloaded package failed its size or checksum verification.
    #[error("Integrity check failed: {0}")]
    Integrity(String),

    /// The package could not be unpacked into the staging directory.
    #[error("Extraction failed: {0}")]
    Extraction(String),

    /// The live installation was modified and then the install failed.
    #[error("Install interrupted after live files were modified: {0}")]
    PartialInstall(String),

    /// The new version never reported itself healthy.
    #[error("Agent did not become live: {0}")]
    ServiceStartFailure(String),

    /// A start/stop/status request to the service manager failed.
    #[error("Service control failed: {0}")]
    ServiceControl(String),

    /// Rollback itself failed. Requires manual intervention.
    #[error("Rollback failed, manual intervention required: {0}")]
    FatalRollback(String),

    /// The operator cancelled the update.
    #[error("Update cancelled during {0}")]
    Cancelled(InstallationState),

    /// The persisted session record could not be read or written, or a
    /// transition was not allowed.
    #[error("Session state error: {0}")]
    State(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl UpdateError {
    /// Short machine-readable name used in the diagnostic trail.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Resolution(_) => "resolution_error",
            Self::SessionInProgress { .. } => "session_in_progress",
            Self::DrainTimeout(_) => "drain_timeout",
            Self::Backup(_) => "backup_error",
            Self::Download(_) => "download_error",
            Self::Integrity(_) => "integrity_error",
            Self::Extraction(_) => "extraction_error",
            Self::PartialInstall(_) => "partial_install",
            Self::ServiceStartFailure(_) => "service_start_failure",
            Self::ServiceControl(_) => "service_control_error",
            Self::FatalRollback(_) => "fatal_rollback",
            Self::Cancelled(_) => "cancelled",
            Self::State(_) => "state_error",
            Self::Config(_) => "config_error",
        }
    }
}

/// Result type alias for orchestrator operations.
pub type Result<T> = std::result::Result<T, UpdateError>;
