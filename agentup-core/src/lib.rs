//! # agentup-core
//!
//! Update orchestration for a long-running agent process on a managed host.
//!
//! An update is one [`UpdateSession`] driven through the
//! [`InstallationState`] machine by the [`UpdateOrchestrator`]:
//! resolve the target version, wait for the agent to drain, snapshot its
//! stateful files, swap in the new release, and verify it comes up live.
//! A failure after the live installation was touched rolls the host back
//! to the previous version and state.
//!
//! Everything that talks to the outside world sits behind the traits in
//! [`traits`]. In-memory implementations live in [`mock`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use agentup_core::{HostLayout, UpdateOrchestrator, UpdateRequest};
//!
//! let orchestrator = UpdateOrchestrator::new(layout, settings, collaborators, cancel)?;
//! let report = orchestrator.run(UpdateRequest::default()).await?;
//! println!("{}", report);
//! ```

pub mod backup;
pub mod drain;
pub mod error;
mod fsutil;
pub mod installer;
pub mod layout;
pub mod mock;
pub mod orchestrator;
pub mod poll;
pub mod resolver;
pub mod rollback;
pub mod service;
pub mod session;
pub mod traits;
pub mod version;

pub use backup::{BackupManager, Snapshot};
pub use drain::{DrainController, DrainOutcome};
pub use error::{Result, UpdateError};
pub use installer::{InstallResult, Installer, PreviousRestore};
pub use layout::HostLayout;
pub use orchestrator::{
    Collaborators, OrchestratorSettings, UpdateOrchestrator, UpdateOutcome, UpdateReport, UpdateRequest,
};
pub use poll::{poll_until, PollOutcome};
pub use resolver::{Resolution, VersionResolver};
pub use rollback::RollbackManager;
pub use service::ServiceSupervisor;
pub use session::{InstallationState, SessionStore, StageRecord, UpdateSession};
pub use traits::{
    AgentHealth, AgentProbe, ArchiveExtractor, PackageFetcher, ServiceController, ServiceState, VersionSource,
};
pub use version::{parse_version, AgentVersion, PackageLocator};
