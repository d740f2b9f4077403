//! Backup Manager - snapshots of the agent's stateful files.
//!
//! A snapshot is a timestamped directory under the snapshot root holding a
//! copy of every stateful entry plus a `snapshot.json` manifest. Snapshots
//! are assembled in a hidden staging directory and renamed into place only
//! once every file has been copied, so a failed backup leaves nothing behind.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{Result, UpdateError};
use crate::fsutil::{copy_path, list_entries, remove_path, write_atomic};

const MANIFEST_FILE: &str = "snapshot.json";
const STAGING_PREFIX: &str = ".staging-";

/// Contents of `snapshot.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotManifest {
    id: String,
    created_at: DateTime<Utc>,
    files: Vec<PathBuf>,
}

/// Handle to an immutable backup snapshot on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub id: String,
    pub created_at: DateTime<Utc>,
    /// Directory holding the copied files.
    pub path: PathBuf,
    /// Captured entries, relative to the install directory.
    pub files: Vec<PathBuf>,
}

impl Snapshot {
    /// Copy every captured entry back under `install_dir`, replacing what is
    /// there. Each entry is copied to a temporary sibling first and renamed
    /// over the original.
    pub async fn apply_to(&self, install_dir: &Path) -> Result<()> {
        for rel in &self.files {
            let src = self.path.join(rel);
            let dest = install_dir.join(rel);
            let tmp = install_dir.join(format!(
                ".{}.restore",
                rel.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
            ));

            remove_path(&tmp).await.map_err(|e| restore_err(rel, e))?;
            copy_path(&src, &tmp).await.map_err(|e| restore_err(rel, e))?;
            if fs::metadata(&tmp).await.map(|m| m.is_dir()).unwrap_or(false) {
                remove_path(&dest).await.map_err(|e| restore_err(rel, e))?;
            }
            fs::rename(&tmp, &dest).await.map_err(|e| restore_err(rel, e))?;

            debug!(file = %rel.display(), snapshot = %self.id, "Restored stateful file");
        }
        Ok(())
    }
}

fn restore_err(rel: &Path, e: std::io::Error) -> UpdateError {
    UpdateError::Backup(format!("failed to restore {}: {}", rel.display(), e))
}

/// Creates, restores, and prunes snapshots of the stateful files.
#[derive(Debug, Clone)]
pub struct BackupManager {
    install_dir: PathBuf,
    snapshot_root: PathBuf,
    stateful_files: Vec<PathBuf>,
}

impl BackupManager {
    pub fn new(
        install_dir: impl Into<PathBuf>,
        snapshot_root: impl Into<PathBuf>,
        stateful_files: Vec<PathBuf>,
    ) -> Self {
        Self {
            install_dir: install_dir.into(),
            snapshot_root: snapshot_root.into(),
            stateful_files,
        }
    }

    pub fn stateful_files(&self) -> &[PathBuf] {
        &self.stateful_files
    }

    /// Copy every stateful entry into a new snapshot.
    ///
    /// All-or-nothing: a missing or unreadable entry fails the whole backup
    /// and removes the staging directory.
    #[instrument(skip(self), fields(install_dir = %self.install_dir.display()))]
    pub async fn create_snapshot(&self) -> Result<Snapshot> {
        let created_at = Utc::now();
        let id = format!(
            "{}-{}",
            created_at.format("%Y%m%dT%H%M%S%.6fZ"),
            &Uuid::new_v4().simple().to_string()[..8]
        );

        fs::create_dir_all(&self.snapshot_root)
            .await
            .map_err(|e| UpdateError::Backup(format!("failed to create snapshot root: {}", e)))?;

        let staging = self.snapshot_root.join(format!("{}{}", STAGING_PREFIX, id));
        if let Err(e) = self.stage_snapshot(&staging, &id, created_at).await {
            if let Err(cleanup) = remove_path(&staging).await {
                warn!(path = %staging.display(), error = %cleanup, "Failed to remove partial snapshot");
            }
            return Err(e);
        }

        let path = self.snapshot_root.join(&id);
        fs::rename(&staging, &path).await.map_err(|e| {
            UpdateError::Backup(format!("failed to finalize snapshot {}: {}", id, e))
        })?;

        info!(
            snapshot = %id,
            files = self.stateful_files.len(),
            path = %path.display(),
            "Snapshot created"
        );

        Ok(Snapshot {
            id,
            created_at,
            path,
            files: self.stateful_files.clone(),
        })
    }

    async fn stage_snapshot(&self, staging: &Path, id: &str, created_at: DateTime<Utc>) -> Result<()> {
        fs::create_dir_all(staging)
            .await
            .map_err(|e| UpdateError::Backup(format!("failed to create staging directory: {}", e)))?;

        for rel in &self.stateful_files {
            let src = self.install_dir.join(rel);
            if fs::symlink_metadata(&src).await.is_err() {
                return Err(UpdateError::Backup(format!(
                    "required stateful file {} is missing",
                    src.display()
                )));
            }

            copy_path(&src, &staging.join(rel)).await.map_err(|e| {
                UpdateError::Backup(format!("failed to copy {}: {}", src.display(), e))
            })?;
        }

        let manifest = SnapshotManifest {
            id: id.to_string(),
            created_at,
            files: self.stateful_files.clone(),
        };
        let json = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| UpdateError::Backup(format!("failed to encode manifest: {}", e)))?;
        write_atomic(&staging.join(MANIFEST_FILE), &json)
            .await
            .map_err(|e| UpdateError::Backup(format!("failed to write manifest: {}", e)))?;

        Ok(())
    }

    /// Copy a snapshot back over the live stateful files. Idempotent.
    ///
    /// Unlike a plain re-apply, a live entry whose kind no longer matches the
    /// saved one (a directory where a file was, or the reverse) is removed
    /// first.
    #[instrument(skip(self, snapshot), fields(snapshot = %snapshot.id))]
    pub async fn restore(&self, snapshot: &Snapshot) -> Result<()> {
        for rel in &snapshot.files {
            let live = self.install_dir.join(rel);
            let saved_is_dir = fs::metadata(snapshot.path.join(rel))
                .await
                .map(|m| m.is_dir())
                .unwrap_or(false);
            if let Ok(meta) = fs::symlink_metadata(&live).await {
                if meta.is_dir() != saved_is_dir {
                    warn!(file = %rel.display(), "Live entry changed kind, replacing it");
                    remove_path(&live).await.map_err(|e| restore_err(rel, e))?;
                }
            }
        }
        snapshot.apply_to(&self.install_dir).await?;
        info!(files = snapshot.files.len(), "Snapshot restored");
        Ok(())
    }

    /// Re-open a snapshot by id, e.g. from a session left by a crashed
    /// process.
    pub async fn load(&self, id: &str) -> Result<Snapshot> {
        let path = self.snapshot_root.join(id);
        let raw = fs::read(path.join(MANIFEST_FILE)).await.map_err(|e| {
            UpdateError::Backup(format!("snapshot {} is unreadable: {}", id, e))
        })?;
        let manifest: SnapshotManifest = serde_json::from_slice(&raw).map_err(|e| {
            UpdateError::Backup(format!("snapshot {} has a corrupt manifest: {}", id, e))
        })?;

        Ok(Snapshot {
            id: manifest.id,
            created_at: manifest.created_at,
            path,
            files: manifest.files,
        })
    }

    /// All complete snapshots, oldest first.
    pub async fn list(&self) -> Result<Vec<Snapshot>> {
        let names = list_entries(&self.snapshot_root)
            .await
            .map_err(|e| UpdateError::Backup(format!("failed to list snapshots: {}", e)))?;

        let mut snapshots = Vec::new();
        for name in names {
            let name = name.to_string_lossy();
            if name.starts_with(STAGING_PREFIX) {
                continue;
            }
            match self.load(&name).await {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => warn!(entry = %name, error = %e, "Skipping unreadable snapshot"),
            }
        }

        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(snapshots)
    }

    /// Delete the oldest snapshots so at most `retain` remain. `0` keeps
    /// everything. Returns how many were removed.
    pub async fn prune(&self, retain: usize) -> Result<usize> {
        if retain == 0 {
            return Ok(0);
        }

        let snapshots = self.list().await?;
        let excess = snapshots.len().saturating_sub(retain);
        for snapshot in snapshots.iter().take(excess) {
            info!(snapshot = %snapshot.id, "Removing old snapshot");
            remove_path(&snapshot.path).await.map_err(|e| {
                UpdateError::Backup(format!("failed to remove snapshot {}: {}", snapshot.id, e))
            })?;
        }
        Ok(excess)
    }

    /// Remove staging directories left by a backup that was interrupted.
    pub async fn cleanup_staging(&self) -> Result<()> {
        let names = list_entries(&self.snapshot_root)
            .await
            .map_err(|e| UpdateError::Backup(format!("failed to list snapshots: {}", e)))?;

        for name in names {
            if name.to_string_lossy().starts_with(STAGING_PREFIX) {
                let path = self.snapshot_root.join(&name);
                warn!(path = %path.display(), "Removing interrupted snapshot staging directory");
                remove_path(&path)
                    .await
                    .map_err(|e| UpdateError::Backup(format!("failed to remove {}: {}", path.display(), e)))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seed(install_dir: &Path) -> Vec<PathBuf> {
        fs::create_dir_all(install_dir).await.unwrap();
        fs::write(install_dir.join(".identity"), b"{\"agent_id\":42}").await.unwrap();
        fs::write(install_dir.join(".credentials"), [0u8, 159, 146, 150, 1]).await.unwrap();
        fs::create_dir_all(install_dir.join(".paths")).await.unwrap();
        fs::write(install_dir.join(".paths/work"), b"/srv/work").await.unwrap();
        vec![".identity".into(), ".credentials".into(), ".paths".into()]
    }

    #[tokio::test]
    async fn test_snapshot_restore_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let install = tmp.path().join("install");
        let files = seed(&install).await;
        let manager = BackupManager::new(&install, tmp.path().join("snapshots"), files);

        let snapshot = manager.create_snapshot().await.unwrap();

        fs::write(install.join(".identity"), b"clobbered").await.unwrap();
        fs::remove_file(install.join(".credentials")).await.unwrap();
        fs::write(install.join(".paths/work"), b"/elsewhere").await.unwrap();

        manager.restore(&snapshot).await.unwrap();
        manager.restore(&snapshot).await.unwrap();

        assert_eq!(fs::read(install.join(".identity")).await.unwrap(), b"{\"agent_id\":42}");
        assert_eq!(fs::read(install.join(".credentials")).await.unwrap(), [0u8, 159, 146, 150, 1]);
        assert_eq!(fs::read(install.join(".paths/work")).await.unwrap(), b"/srv/work");
    }

    #[tokio::test]
    async fn test_restore_replaces_entry_of_another_kind() {
        let tmp = tempfile::tempdir().unwrap();
        let install = tmp.path().join("install");
        let files = seed(&install).await;
        let manager = BackupManager::new(&install, tmp.path().join("snapshots"), files);
        let snapshot = manager.create_snapshot().await.unwrap();

        fs::remove_file(install.join(".identity")).await.unwrap();
        fs::create_dir_all(install.join(".identity/cache")).await.unwrap();
        assert!(snapshot.apply_to(&install).await.is_err());

        manager.restore(&snapshot).await.unwrap();
        assert_eq!(fs::read(install.join(".identity")).await.unwrap(), b"{\"agent_id\":42}");
        assert_eq!(fs::read(install.join(".paths/work")).await.unwrap(), b"/srv/work");
    }

    #[tokio::test]
    async fn test_missing_file_leaves_no_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let install = tmp.path().join("install");
        let mut files = seed(&install).await;
        files.push(".runner".into());
        let root = tmp.path().join("snapshots");
        let manager = BackupManager::new(&install, &root, files);

        let err = manager.create_snapshot().await.unwrap_err();
        assert!(matches!(err, UpdateError::Backup(_)));
        assert!(list_entries(&root).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_load_list_and_prune() {
        let tmp = tempfile::tempdir().unwrap();
        let install = tmp.path().join("install");
        let files = seed(&install).await;
        let manager = BackupManager::new(&install, tmp.path().join("snapshots"), files);

        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(manager.create_snapshot().await.unwrap().id);
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let loaded = manager.load(&ids[1]).await.unwrap();
        assert_eq!(loaded.files.len(), 3);

        assert_eq!(manager.prune(2).await.unwrap(), 2);
        let remaining: Vec<_> = manager.list().await.unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(remaining, ids[2..].to_vec());
        assert_eq!(manager.prune(0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_staging() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("snapshots");
        fs::create_dir_all(root.join(".staging-dead")).await.unwrap();
        let manager = BackupManager::new(tmp.path().join("install"), &root, Vec::new());

        manager.cleanup_staging().await.unwrap();
        assert!(list_entries(&root).await.unwrap().is_empty());
    }
}
