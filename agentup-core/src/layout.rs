//! On-disk layout of the managed installation and the orchestrator's own
//! state.

use std::path::{Path, PathBuf};

use crate::error::{Result, UpdateError};
use crate::fsutil::is_top_level_name;

/// Default name of the installed-version metadata file.
pub const DEFAULT_VERSION_FILE: &str = ".agent-version";

/// Where the agent lives and where the orchestrator keeps its records.
///
/// ```text
/// install_dir/                 data_dir/
///   .agent-version               session.json      in-flight marker
///   <stateful files>             snapshots/<id>/   backup snapshots
///   <binaries...>                previous/         kept-aside binaries
///                                downloads/        fetched packages
///                                staging/          extracted packages
/// ```
#[derive(Debug, Clone)]
pub struct HostLayout {
    pub install_dir: PathBuf,
    pub data_dir: PathBuf,
    /// Version metadata file name, relative to `install_dir`.
    pub version_file: PathBuf,
    /// Stateful entries that survive every update, relative to `install_dir`.
    pub stateful_files: Vec<PathBuf>,
}

impl HostLayout {
    pub fn new(install_dir: impl Into<PathBuf>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            install_dir: install_dir.into(),
            data_dir: data_dir.into(),
            version_file: PathBuf::from(DEFAULT_VERSION_FILE),
            stateful_files: Vec::new(),
        }
    }

    pub fn with_stateful_files<I, P>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.stateful_files = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_version_file(mut self, name: impl Into<PathBuf>) -> Self {
        self.version_file = name.into();
        self
    }

    /// Stateful entries and the version file must be plain names directly
    /// inside `install_dir`, and the two directories must not nest.
    pub fn validate(&self) -> Result<()> {
        if !is_top_level_name(&self.version_file) {
            return Err(UpdateError::Config(format!(
                "version file '{}' must be a plain file name",
                self.version_file.display()
            )));
        }

        for file in &self.stateful_files {
            if !is_top_level_name(file) {
                return Err(UpdateError::Config(format!(
                    "stateful file '{}' must be a plain name inside the install directory",
                    file.display()
                )));
            }
            if *file == self.version_file {
                return Err(UpdateError::Config(format!(
                    "'{}' cannot be both the version file and a stateful file",
                    file.display()
                )));
            }
        }

        if self.data_dir.starts_with(&self.install_dir) || self.install_dir.starts_with(&self.data_dir) {
            return Err(UpdateError::Config(format!(
                "data dir '{}' and install dir '{}' must not contain each other",
                self.data_dir.display(),
                self.install_dir.display()
            )));
        }

        Ok(())
    }

    pub fn version_file_path(&self) -> PathBuf {
        self.install_dir.join(&self.version_file)
    }

    pub fn session_file(&self) -> PathBuf {
        self.data_dir.join("session.json")
    }

    pub fn snapshot_root(&self) -> PathBuf {
        self.data_dir.join("snapshots")
    }

    pub fn previous_dir(&self) -> PathBuf {
        self.data_dir.join("previous")
    }

    pub fn download_dir(&self) -> PathBuf {
        self.data_dir.join("downloads")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.data_dir.join("staging")
    }

    pub fn is_stateful(&self, name: &Path) -> bool {
        self.stateful_files.iter().any(|f| f == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_validation() {
        let layout = HostLayout::new("/opt/agent", "/var/lib/agentup")
            .with_stateful_files([".identity", ".credentials"]);
        assert!(layout.validate().is_ok());
        assert!(layout.is_stateful(Path::new(".identity")));
        assert!(!layout.is_stateful(Path::new("bin")));

        let nested = layout.clone().with_stateful_files(["conf/.identity"]);
        assert!(nested.validate().is_err());

        let clash = layout.clone().with_stateful_files([DEFAULT_VERSION_FILE]);
        assert!(clash.validate().is_err());

        let inside = HostLayout::new("/opt/agent", "/opt/agent/.update");
        assert!(inside.validate().is_err());
    }

    #[test]
    fn test_derived_paths() {
        let layout = HostLayout::new("/opt/agent", "/var/lib/agentup");
        assert_eq!(layout.session_file(), PathBuf::from("/var/lib/agentup/session.json"));
        assert_eq!(layout.version_file_path(), PathBuf::from("/opt/agent/.agent-version"));
        assert_eq!(layout.previous_dir(), PathBuf::from("/var/lib/agentup/previous"));
    }
}
