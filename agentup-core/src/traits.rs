//! Seams between the orchestrator and the outside world.
//!
//! Every external mechanism the orchestrator depends on (version lookup,
//! agent health, service manager, package transport, archive format) sits
//! behind one of these traits so the state machine can be driven by the
//! in-memory fakes in [`crate::mock`].

use std::path::Path;

use async_trait::async_trait;
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::version::{AgentVersion, PackageLocator};

/// Read-only query for published agent versions.
#[async_trait]
pub trait VersionSource: Send + Sync {
    /// Newest published version on `channel`.
    async fn latest(&self, channel: &str) -> Result<AgentVersion>;

    /// A specific published version on `channel`.
    async fn release(&self, channel: &str, version: &Version) -> Result<AgentVersion>;
}

/// Health as reported by the agent itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentHealth {
    pub healthy: bool,
    /// Version the running process reports, if it reports one.
    #[serde(default)]
    pub version: Option<Version>,
}

/// Read-only queries against the running agent.
#[async_trait]
pub trait AgentProbe: Send + Sync {
    /// Whether a unit of work is currently executing.
    async fn is_busy(&self) -> Result<bool>;

    /// Whether the process is up and which version it runs.
    async fn health(&self) -> Result<AgentHealth>;
}

/// State of the managed process as seen by the service manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Running,
    Stopped,
    Unknown,
}

/// Start/stop control over the managed agent process.
#[async_trait]
pub trait ServiceController: Send + Sync {
    /// Service name, for logging.
    fn name(&self) -> &str;

    /// Launch the process. Returns once the request is accepted.
    async fn start(&self) -> Result<()>;

    /// Request a graceful shutdown. Does not wait for exit.
    async fn stop(&self) -> Result<()>;

    /// Terminate the process forcibly.
    async fn kill(&self) -> Result<()>;

    async fn status(&self) -> Result<ServiceState>;
}

/// Transfers a package to a local file.
#[async_trait]
pub trait PackageFetcher: Send + Sync {
    /// Write the package at `package` to `dest`.
    ///
    /// Implementations report failures as [`crate::UpdateError::Download`].
    async fn fetch(&self, package: &PackageLocator, dest: &Path) -> Result<()>;
}

/// Unpacks a downloaded package into a directory.
#[async_trait]
pub trait ArchiveExtractor: Send + Sync {
    /// Extract `archive` into the existing, empty directory `dest`.
    ///
    /// Implementations report failures as [`crate::UpdateError::Extraction`].
    async fn extract(&self, archive: &Path, dest: &Path) -> Result<()>;
}
