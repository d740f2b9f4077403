//! Version Resolver - decides whether an update is needed and to what.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use semver::Version;
use tokio::fs;
use tracing::{info, instrument, warn};

use crate::error::{Result, UpdateError};
use crate::traits::VersionSource;
use crate::version::{parse_version, AgentVersion};

/// Outcome of version resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Nothing newer to install. Not an error.
    AlreadyCurrent {
        current: Version,
        available: AgentVersion,
    },
    /// `target` should be installed over `current`.
    Upgrade {
        current: Version,
        target: AgentVersion,
    },
}

/// Compares the installed version with what the version source publishes.
pub struct VersionResolver {
    source: Arc<dyn VersionSource>,
    channel: String,
    version_file: PathBuf,
}

impl VersionResolver {
    pub fn new(source: Arc<dyn VersionSource>, channel: impl Into<String>, version_file: impl Into<PathBuf>) -> Self {
        Self {
            source,
            channel: channel.into(),
            version_file: version_file.into(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Version recorded in the installation's metadata file.
    ///
    /// A missing file means nothing is installed yet and reads as `0.0.0`.
    pub async fn installed_version(&self) -> Result<Version> {
        match fs::read_to_string(&self.version_file).await {
            Ok(content) => parse_version(&content).map_err(|_| {
                UpdateError::Resolution(format!(
                    "installed version file {} is malformed: '{}'",
                    self.version_file.display(),
                    content.trim()
                ))
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(path = %self.version_file.display(), "No installed version recorded, assuming fresh install");
                Ok(Version::new(0, 0, 0))
            }
            Err(e) => Err(UpdateError::Resolution(format!(
                "failed to read {}: {}",
                self.version_file.display(),
                e
            ))),
        }
    }

    /// Determine the target version.
    ///
    /// Without `requested` the newest release on the channel is the target.
    /// A target that is not newer than the installed version resolves to
    /// [`Resolution::AlreadyCurrent`] unless `force` is set together with an
    /// explicit `requested` version, which allows reinstalls and downgrades.
    #[instrument(skip(self), fields(channel = %self.channel))]
    pub async fn resolve(&self, requested: Option<&Version>, force: bool) -> Result<Resolution> {
        let current = self.installed_version().await?;

        let target = match requested {
            Some(version) => self.source.release(&self.channel, version).await?,
            None => self.source.latest(&self.channel).await?,
        };

        if let Some(requested) = requested {
            if target.number != *requested {
                return Err(UpdateError::Resolution(format!(
                    "version source returned {} when {} was requested",
                    target.number, requested
                )));
            }
        }

        let explicit_force = force && requested.is_some();
        if target.number <= current && !explicit_force {
            info!(current = %current, available = %target.number, "Agent is already current");
            return Ok(Resolution::AlreadyCurrent {
                current,
                available: target,
            });
        }

        info!(
            current = %current,
            target = %target.number,
            package = %target.package,
            forced = explicit_force,
            "Update target resolved"
        );
        Ok(Resolution::Upgrade { current, target })
    }
}
