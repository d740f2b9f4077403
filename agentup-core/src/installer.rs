//! Installer - downloads, verifies, stages, and swaps in a new agent version.
//!
//! The install runs in two phases:
//!
//! 1. **Prepare**: fetch the package, verify size and checksum, extract it
//!    into the staging directory, and write the version metadata file into
//!    the staged tree. Nothing under the install directory is touched.
//! 2. **Commit**: copy the live non-stateful entries into the `previous`
//!    directory (sealed by a manifest once complete), then remove them and
//!    move the staged entries into place, then re-apply the snapshot.
//!
//! A failure before the `previous` manifest is written leaves the live tree
//! as it was and is reported as [`InstallResult::Aborted`]. A failure after
//! that point is [`InstallResult::Partial`] and requires a rollback, which
//! re-stages the kept-aside entries with [`Installer::restore_previous`].

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs::{self, File};
use tokio::io::AsyncReadExt;
use tracing::{error, info, instrument, warn};

use crate::backup::Snapshot;
use crate::error::{Result, UpdateError};
use crate::fsutil::{copy_path, list_entries, move_path, remove_path, write_atomic};
use crate::layout::HostLayout;
use crate::traits::{ArchiveExtractor, PackageFetcher};
use crate::version::{parse_version, AgentVersion};

/// Seals the `previous` directory once every live entry has been copied.
const KEPT_MANIFEST: &str = ".agentup-kept.json";

/// Result of an install attempt.
#[derive(Debug)]
pub enum InstallResult {
    /// The new version is in place with stateful files preserved.
    Installed { version: Version },
    /// Failed before the live installation was modified. No rollback needed.
    Aborted(UpdateError),
    /// Failed after the live installation was modified. Rollback required.
    Partial(UpdateError),
}

/// Outcome of re-staging the kept-aside binaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviousRestore {
    /// The kept-aside entries were copied back over the live tree.
    Restored,
    /// No sealed `previous` directory exists: either the live tree was
    /// never modified, or an earlier restore already completed.
    NothingKept,
}

#[derive(Debug, Serialize, Deserialize)]
struct KeptRelease {
    version: Option<String>,
    entries: Vec<String>,
    kept_at: DateTime<Utc>,
}

impl KeptRelease {
    /// Whether these entries were kept aside by an update starting from
    /// `version`. No recorded version means a fresh install.
    fn belongs_to(&self, version: &Version) -> bool {
        match self.version.as_deref() {
            Some(raw) => parse_version(raw).map(|kept| &kept == version).unwrap_or(false),
            None => *version == Version::new(0, 0, 0),
        }
    }
}

/// Stages and swaps agent releases on disk.
pub struct Installer {
    layout: HostLayout,
    fetcher: Arc<dyn PackageFetcher>,
    extractor: Arc<dyn ArchiveExtractor>,
}

impl Installer {
    pub fn new(layout: HostLayout, fetcher: Arc<dyn PackageFetcher>, extractor: Arc<dyn ArchiveExtractor>) -> Self {
        Self {
            layout,
            fetcher,
            extractor,
        }
    }

    /// Install `target`, re-applying `preserve` over the new files.
    #[instrument(skip(self, target, preserve), fields(version = %target.number, package = %target.package))]
    pub async fn install(&self, target: &AgentVersion, preserve: Option<&Snapshot>) -> InstallResult {
        let staging = match self.prepare(target).await {
            Ok(staging) => staging,
            Err(e) => {
                error!(error = %e, "Package preparation failed, live installation untouched");
                self.cleanup_scratch().await;
                return InstallResult::Aborted(e);
            }
        };

        let result = self.commit(&staging, target, preserve).await;
        self.cleanup_scratch().await;
        result
    }

    async fn prepare(&self, target: &AgentVersion) -> Result<PathBuf> {
        let download_dir = self.layout.download_dir();
        let staging = self.layout.staging_dir();

        for dir in [&download_dir, &staging] {
            let reset = match remove_path(dir).await {
                Ok(()) => fs::create_dir_all(dir).await,
                Err(e) => Err(e),
            };
            reset.map_err(|e| UpdateError::Download(format!("failed to prepare {}: {}", dir.display(), e)))?;
        }

        let archive = download_dir.join(target.package.file_name().unwrap_or("package"));
        info!(dest = %archive.display(), "Fetching package");
        self.fetcher
            .fetch(&target.package, &archive)
            .await
            .map_err(|e| match e {
                UpdateError::Download(_) => e,
                other => UpdateError::Download(other.to_string()),
            })?;

        verify_integrity(&archive, target).await?;

        info!(staging = %staging.display(), "Extracting package");
        self.extractor
            .extract(&archive, &staging)
            .await
            .map_err(|e| match e {
                UpdateError::Extraction(_) => e,
                other => UpdateError::Extraction(other.to_string()),
            })?;

        let entries = list_entries(&staging)
            .await
            .map_err(|e| UpdateError::Extraction(format!("failed to read staging directory: {}", e)))?;
        if entries.is_empty() {
            return Err(UpdateError::Extraction("package contained no files".to_string()));
        }

        // A package never overwrites host state.
        for name in self.layout.stateful_files.iter() {
            let shipped = staging.join(name);
            if fs::symlink_metadata(&shipped).await.is_ok() {
                warn!(file = %name.display(), "Package ships a stateful file, discarding it");
                remove_path(&shipped).await.map_err(|e| {
                    UpdateError::Extraction(format!("failed to discard {}: {}", name.display(), e))
                })?;
            }
        }

        write_atomic(
            &staging.join(&self.layout.version_file),
            format!("{}\n", target.number).as_bytes(),
        )
        .await
        .map_err(|e| UpdateError::Extraction(format!("failed to write version file: {}", e)))?;

        Ok(staging)
    }

    async fn commit(&self, staging: &Path, target: &AgentVersion, preserve: Option<&Snapshot>) -> InstallResult {
        if let Err(e) = self.keep_previous().await {
            error!(error = %e, "Failed to keep previous binaries aside, live installation untouched");
            if let Err(cleanup) = remove_path(&self.layout.previous_dir()).await {
                warn!(error = %cleanup, "Failed to remove incomplete previous directory");
            }
            return InstallResult::Aborted(UpdateError::Backup(format!(
                "failed to keep previous binaries aside: {}",
                e
            )));
        }

        if let Err(e) = self.swap_in(staging).await {
            error!(error = %e, "Swap failed after live files were modified");
            return InstallResult::Partial(UpdateError::PartialInstall(e.to_string()));
        }

        if let Some(snapshot) = preserve {
            if let Err(e) = snapshot.apply_to(&self.layout.install_dir).await {
                error!(error = %e, "Failed to re-apply snapshot over new files");
                return InstallResult::Partial(UpdateError::PartialInstall(format!(
                    "failed to re-apply snapshot {}: {}",
                    snapshot.id, e
                )));
            }
        }

        info!(version = %target.number, "New version installed");
        InstallResult::Installed {
            version: target.number.clone(),
        }
    }

    /// Copy every live non-stateful entry into `previous` and seal it.
    async fn keep_previous(&self) -> io::Result<()> {
        let install_dir = &self.layout.install_dir;
        let previous = self.layout.previous_dir();

        fs::create_dir_all(install_dir).await?;
        remove_path(&previous).await?;
        fs::create_dir_all(&previous).await?;

        let entries = self.live_entries().await?;
        for name in &entries {
            copy_path(&install_dir.join(name), &previous.join(name)).await?;
        }

        let version = fs::read_to_string(self.layout.version_file_path())
            .await
            .ok()
            .map(|v| v.trim().to_string());
        let kept = KeptRelease {
            version,
            entries,
            kept_at: Utc::now(),
        };
        let json = serde_json::to_vec_pretty(&kept).map_err(io::Error::other)?;
        write_atomic(&previous.join(KEPT_MANIFEST), &json).await?;

        info!(
            entries = kept.entries.len(),
            version = ?kept.version,
            path = %previous.display(),
            "Previous binaries kept aside"
        );
        Ok(())
    }

    async fn swap_in(&self, staging: &Path) -> io::Result<()> {
        let install_dir = &self.layout.install_dir;

        for name in self.live_entries().await? {
            remove_path(&install_dir.join(&name)).await?;
        }

        for name in list_entries(staging).await? {
            move_path(&staging.join(&name), &install_dir.join(&name)).await?;
        }
        Ok(())
    }

    /// Names of live entries that an install replaces.
    async fn live_entries(&self) -> io::Result<Vec<String>> {
        let names = list_entries(&self.layout.install_dir).await?;
        Ok(names
            .into_iter()
            .filter(|name| !self.layout.is_stateful(Path::new(name)))
            .map(|name| name.to_string_lossy().into_owned())
            .collect())
    }

    /// Whether a sealed `previous` directory exists.
    pub async fn has_kept_previous(&self) -> bool {
        fs::metadata(self.layout.previous_dir().join(KEPT_MANIFEST)).await.is_ok()
    }

    /// Replace the live non-stateful entries with the kept-aside ones.
    ///
    /// `expected` is the version the interrupted session started from. A
    /// sealed directory holding any other version was left behind by an
    /// earlier update; it is discarded and the live tree is left alone.
    ///
    /// Copies rather than moves, so an interrupted restore can simply be run
    /// again. The `previous` directory is removed only after every entry is
    /// back in place.
    #[instrument(skip(self))]
    pub async fn restore_previous(&self, expected: Option<&Version>) -> Result<PreviousRestore> {
        let previous = self.layout.previous_dir();
        let manifest = match fs::read(previous.join(KEPT_MANIFEST)).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                remove_path(&previous).await.map_err(restage_err)?;
                info!("No sealed previous binaries, live tree was not replaced");
                return Ok(PreviousRestore::NothingKept);
            }
            Err(e) => return Err(restage_err(e)),
        };
        let kept: KeptRelease = serde_json::from_slice(&manifest).map_err(|e| {
            UpdateError::FatalRollback(format!("previous binaries manifest is corrupt: {}", e))
        })?;

        if let Some(expected) = expected {
            if !kept.belongs_to(expected) {
                warn!(kept = ?kept.version, expected = %expected, "Sealed previous binaries are from another release, discarding");
                remove_path(&previous).await.map_err(restage_err)?;
                return Ok(PreviousRestore::NothingKept);
            }
        }

        for name in &kept.entries {
            if fs::symlink_metadata(previous.join(name)).await.is_err() {
                return Err(UpdateError::FatalRollback(format!(
                    "kept-aside entry '{}' is missing from {}",
                    name,
                    previous.display()
                )));
            }
        }

        let install_dir = &self.layout.install_dir;
        for name in self.live_entries().await.map_err(restage_err)? {
            remove_path(&install_dir.join(&name)).await.map_err(restage_err)?;
        }
        for name in &kept.entries {
            copy_path(&previous.join(name), &install_dir.join(name))
                .await
                .map_err(restage_err)?;
        }
        remove_path(&previous).await.map_err(restage_err)?;

        info!(version = ?kept.version, entries = kept.entries.len(), "Previous binaries re-staged");
        Ok(PreviousRestore::Restored)
    }

    /// Delete the kept-aside binaries once the new version is verified.
    pub async fn discard_previous(&self) -> Result<()> {
        let previous = self.layout.previous_dir();
        remove_path(&previous)
            .await
            .map_err(|e| UpdateError::State(format!("failed to remove {}: {}", previous.display(), e)))?;
        info!(path = %previous.display(), "Discarded previous binaries");
        Ok(())
    }

    async fn cleanup_scratch(&self) {
        for dir in [self.layout.download_dir(), self.layout.staging_dir()] {
            if let Err(e) = remove_path(&dir).await {
                warn!(path = %dir.display(), error = %e, "Failed to clean scratch directory");
            }
        }
    }
}

fn restage_err(e: io::Error) -> UpdateError {
    UpdateError::FatalRollback(format!("failed to re-stage previous binaries: {}", e))
}

/// Check size and SHA-256 of a downloaded package against what the version
/// source published.
async fn verify_integrity(path: &Path, target: &AgentVersion) -> Result<()> {
    let meta = fs::metadata(path)
        .await
        .map_err(|e| UpdateError::Download(format!("downloaded package missing: {}", e)))?;

    if meta.len() == 0 {
        return Err(UpdateError::Integrity("downloaded package is empty".to_string()));
    }

    if let Some(expected) = target.size_bytes {
        if meta.len() != expected {
            return Err(UpdateError::Integrity(format!(
                "size mismatch: expected {} bytes, got {}",
                expected,
                meta.len()
            )));
        }
    }

    if let Some(expected) = &target.sha256 {
        let mut file = File::open(path)
            .await
            .map_err(|e| UpdateError::Integrity(format!("failed to open package: {}", e)))?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; 64 * 1024];

        loop {
            let n = file
                .read(&mut buffer)
                .await
                .map_err(|e| UpdateError::Integrity(format!("failed to read package: {}", e)))?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }

        let actual = hex::encode(hasher.finalize());
        if !actual.eq_ignore_ascii_case(expected.trim()) {
            error!(expected = %expected, actual = %actual, path = %path.display(), "Checksum mismatch");
            return Err(UpdateError::Integrity(format!(
                "checksum mismatch: expected {}, got {}",
                expected, actual
            )));
        }
        info!(path = %path.display(), "Checksum verified");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::BackupManager;
    use crate::mock::{MockExtractor, MockPackageStore};

    struct Fixture {
        _tmp: tempfile::TempDir,
        layout: HostLayout,
        store: Arc<MockPackageStore>,
        installer: Installer,
    }

    async fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let layout = HostLayout::new(tmp.path().join("agent"), tmp.path().join("state"))
            .with_stateful_files([".identity", ".credentials"]);

        let install = &layout.install_dir;
        fs::create_dir_all(install.join("bin")).await.unwrap();
        fs::write(install.join("bin/agent"), b"agent-1.2.0").await.unwrap();
        fs::write(install.join("run.sh"), b"#!/bin/sh\nexec bin/agent").await.unwrap();
        fs::write(layout.version_file_path(), b"1.2.0\n").await.unwrap();
        fs::write(install.join(".identity"), b"agent-7").await.unwrap();
        fs::write(install.join(".credentials"), b"secret").await.unwrap();

        let store = Arc::new(MockPackageStore::new());
        let installer = Installer::new(layout.clone(), store.clone(), Arc::new(MockExtractor));
        Fixture {
            _tmp: tmp,
            layout,
            store,
            installer,
        }
    }

    async fn read(path: PathBuf) -> String {
        fs::read_to_string(path).await.unwrap()
    }

    #[tokio::test]
    async fn test_install_replaces_binaries_and_keeps_state() {
        let fx = fixture().await;
        let target = fx.store.publish("1.3.0", [("bin/agent", "agent-1.3.0"), (".identity", "shipped-default")]);

        let result = fx.installer.install(&target, None).await;
        assert!(matches!(result, InstallResult::Installed { .. }));

        let install = &fx.layout.install_dir;
        assert_eq!(read(install.join("bin/agent")).await, "agent-1.3.0");
        assert!(!install.join("run.sh").exists());
        assert_eq!(read(fx.layout.version_file_path()).await.trim(), "1.3.0");
        assert_eq!(read(install.join(".identity")).await, "agent-7");
        assert_eq!(read(install.join(".credentials")).await, "secret");
        assert!(fx.installer.has_kept_previous().await);
        assert!(!fx.layout.staging_dir().exists());
        assert!(!fx.layout.download_dir().exists());
    }

    #[tokio::test]
    async fn test_snapshot_is_reapplied() {
        let fx = fixture().await;
        let backups = BackupManager::new(
            &fx.layout.install_dir,
            fx.layout.snapshot_root(),
            fx.layout.stateful_files.clone(),
        );
        let snapshot = backups.create_snapshot().await.unwrap();
        fs::write(fx.layout.install_dir.join(".credentials"), b"drifted").await.unwrap();

        let target = fx.store.publish("1.3.0", [("bin/agent", "agent-1.3.0")]);
        let result = fx.installer.install(&target, Some(&snapshot)).await;
        assert!(matches!(result, InstallResult::Installed { .. }));
        assert_eq!(read(fx.layout.install_dir.join(".credentials")).await, "secret");
    }

    #[tokio::test]
    async fn test_checksum_mismatch_aborts_without_mutation() {
        let fx = fixture().await;
        let target = fx
            .store
            .publish("1.3.0", [("bin/agent", "agent-1.3.0")])
            .with_sha256("00".repeat(32));

        let result = fx.installer.install(&target, None).await;
        assert!(matches!(result, InstallResult::Aborted(UpdateError::Integrity(_))));
        assert_eq!(read(fx.layout.install_dir.join("bin/agent")).await, "agent-1.2.0");
        assert!(fx.layout.install_dir.join("run.sh").exists());
        assert!(!fx.installer.has_kept_previous().await);
    }

    #[tokio::test]
    async fn test_download_and_extraction_failures_abort() {
        let fx = fixture().await;
        let missing = AgentVersion::new(Version::new(2, 0, 0), crate::PackageLocator::new("mock://nowhere"));
        assert!(matches!(
            fx.installer.install(&missing, None).await,
            InstallResult::Aborted(UpdateError::Download(_))
        ));

        let target = fx.store.publish("1.3.0", [("bin/agent", "agent-1.3.0")]);
        fx.store.corrupt(&target.package);
        assert!(matches!(
            fx.installer.install(&target, None).await,
            InstallResult::Aborted(UpdateError::Extraction(_))
        ));

        let empty = fx.store.publish::<_, &str, &str>("1.4.0", []);
        assert!(matches!(
            fx.installer.install(&empty, None).await,
            InstallResult::Aborted(UpdateError::Extraction(_))
        ));

        assert_eq!(read(fx.layout.install_dir.join("bin/agent")).await, "agent-1.2.0");
    }

    #[tokio::test]
    async fn test_restore_previous_round_trip() {
        let fx = fixture().await;
        let target = fx.store.publish("1.3.0", [("bin/agent", "agent-1.3.0"), ("extra.so", "lib")]);
        assert!(matches!(fx.installer.install(&target, None).await, InstallResult::Installed { .. }));

        let from = Version::new(1, 2, 0);
        assert_eq!(fx.installer.restore_previous(Some(&from)).await.unwrap(), PreviousRestore::Restored);
        let install = &fx.layout.install_dir;
        assert_eq!(read(install.join("bin/agent")).await, "agent-1.2.0");
        assert_eq!(read(fx.layout.version_file_path()).await.trim(), "1.2.0");
        assert!(install.join("run.sh").exists());
        assert!(!install.join("extra.so").exists());
        assert_eq!(read(install.join(".identity")).await, "agent-7");

        // Second call finds nothing to restore.
        assert_eq!(fx.installer.restore_previous(Some(&from)).await.unwrap(), PreviousRestore::NothingKept);
    }

    #[tokio::test]
    async fn test_previous_from_another_release_is_not_restored() {
        let fx = fixture().await;
        let target = fx.store.publish("1.3.0", [("bin/agent", "agent-1.3.0")]);
        assert!(matches!(fx.installer.install(&target, None).await, InstallResult::Installed { .. }));

        // Kept entries are 1.2.0, but the interrupted session started from 1.3.0.
        let restore = fx.installer.restore_previous(Some(&Version::new(1, 3, 0))).await.unwrap();
        assert_eq!(restore, PreviousRestore::NothingKept);
        assert_eq!(read(fx.layout.install_dir.join("bin/agent")).await, "agent-1.3.0");
        assert_eq!(read(fx.layout.version_file_path()).await.trim(), "1.3.0");
        assert!(!fx.layout.previous_dir().exists());
    }

    #[tokio::test]
    async fn test_discard_previous() {
        let fx = fixture().await;
        let target = fx.store.publish("1.3.0", [("bin/agent", "agent-1.3.0")]);
        assert!(matches!(fx.installer.install(&target, None).await, InstallResult::Installed { .. }));

        fx.installer.discard_previous().await.unwrap();
        assert!(!fx.installer.has_kept_previous().await);
        assert!(!fx.layout.previous_dir().exists());
    }
}
