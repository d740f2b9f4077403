//! Archive extraction by shelling out to `tar`.

use std::path::{Component, Path};

use agentup_core::{ArchiveExtractor, UpdateError};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, instrument};

/// Compression of a package, detected from its file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    TarZst,
    TarXz,
    Tar,
}

impl ArchiveFormat {
    pub fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().to_ascii_lowercase();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(Self::TarGz)
        } else if name.ends_with(".tar.zst") || name.ends_with(".tzst") {
            Some(Self::TarZst)
        } else if name.ends_with(".tar.xz") || name.ends_with(".txz") {
            Some(Self::TarXz)
        } else if name.ends_with(".tar") {
            Some(Self::Tar)
        } else {
            None
        }
    }

    fn decompress_flag(self) -> Option<&'static str> {
        match self {
            Self::TarGz => Some("--gzip"),
            Self::TarZst => Some("--zstd"),
            Self::TarXz => Some("--xz"),
            Self::Tar => None,
        }
    }
}

/// Extracts `.tar`, `.tar.gz`, `.tar.zst`, and `.tar.xz` packages.
#[derive(Debug, Default, Clone, Copy)]
pub struct TarExtractor;

impl TarExtractor {
    async fn run_tar(&self, format: ArchiveFormat, mode: &str, archive: &Path, dest: Option<&Path>) -> agentup_core::Result<String> {
        let mut cmd = Command::new("tar");
        cmd.arg(mode);
        if let Some(flag) = format.decompress_flag() {
            cmd.arg(flag);
        }
        cmd.arg("-f").arg(archive);
        if let Some(dest) = dest {
            cmd.arg("-C").arg(dest);
        }

        let output = cmd
            .output()
            .await
            .map_err(|e| UpdateError::Extraction(format!("failed to run tar: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(UpdateError::Extraction(format!(
                "tar {} failed: {}",
                mode,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Members must stay inside the extraction directory.
fn check_member(member: &str) -> agentup_core::Result<()> {
    let path = Path::new(member);
    let escapes = path
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)));
    if escapes {
        return Err(UpdateError::Extraction(format!(
            "archive member '{}' escapes the extraction directory",
            member
        )));
    }
    Ok(())
}

/// Link targets must resolve inside the extraction directory as well.
///
/// A symlink resolves from the directory holding it, a hard link names
/// another member relative to the archive root.
fn check_link(member: &str, target: &str, hard: bool) -> agentup_core::Result<()> {
    let base = match Path::new(member).parent() {
        Some(parent) if !hard => parent,
        _ => Path::new(""),
    };

    let mut depth = 0usize;
    let mut escapes = false;
    for component in base.components().chain(Path::new(target).components()) {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => match depth.checked_sub(1) {
                Some(up) => depth = up,
                None => {
                    escapes = true;
                    break;
                }
            },
            Component::RootDir | Component::Prefix(_) => {
                escapes = true;
                break;
            }
        }
    }

    if escapes {
        return Err(UpdateError::Extraction(format!(
            "archive link '{}' -> '{}' points outside the extraction directory",
            member, target
        )));
    }
    Ok(())
}

/// Link target of `member` from its `tar -tv` line, with whether it is a
/// hard link. `None` for anything that is not a link.
fn link_target<'a>(line: &'a str, member: &str) -> agentup_core::Result<Option<(&'a str, bool)>> {
    let (separator, hard) = match line.chars().next() {
        Some('l') => (" -> ", false),
        Some('h') => (" link to ", true),
        _ => return Ok(None),
    };
    let needle = format!("{}{}", member, separator);
    match line.find(&needle) {
        Some(at) => Ok(Some((&line[at + needle.len()..], hard))),
        None => Err(UpdateError::Extraction(format!(
            "cannot read link target of archive member '{}'",
            member
        ))),
    }
}

#[async_trait]
impl ArchiveExtractor for TarExtractor {
    #[instrument(skip(self), fields(archive = %archive.display(), dest = %dest.display()))]
    async fn extract(&self, archive: &Path, dest: &Path) -> agentup_core::Result<()> {
        let format = ArchiveFormat::detect(archive).ok_or_else(|| {
            UpdateError::Extraction(format!("unsupported package format: {}", archive.display()))
        })?;

        let listing = self.run_tar(format, "-t", archive, None).await?;
        let verbose = self.run_tar(format, "-tv", archive, None).await?;
        let names: Vec<&str> = listing.lines().filter(|l| !l.trim().is_empty()).collect();
        let details: Vec<&str> = verbose.lines().filter(|l| !l.trim().is_empty()).collect();
        if names.len() != details.len() {
            return Err(UpdateError::Extraction(format!(
                "archive listing is inconsistent: {} names, {} entries",
                names.len(),
                details.len()
            )));
        }

        for (member, line) in names.iter().zip(&details) {
            check_member(member)?;
            if let Some((target, hard)) = link_target(line, member)? {
                check_link(member, target, hard)?;
            }
        }
        let members = names.len();

        self.run_tar(format, "-x", archive, Some(dest)).await?;
        info!(?format, members, "Package extracted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_format() {
        assert_eq!(ArchiveFormat::detect(Path::new("agent-1.3.0.tar.gz")), Some(ArchiveFormat::TarGz));
        assert_eq!(ArchiveFormat::detect(Path::new("agent.TGZ")), Some(ArchiveFormat::TarGz));
        assert_eq!(ArchiveFormat::detect(Path::new("agent.tar.zst")), Some(ArchiveFormat::TarZst));
        assert_eq!(ArchiveFormat::detect(Path::new("agent.tar")), Some(ArchiveFormat::Tar));
        assert_eq!(ArchiveFormat::detect(Path::new("agent.zip")), None);
    }

    #[test]
    fn test_member_checks() {
        assert!(check_member("bin/agent").is_ok());
        assert!(check_member("./run.sh").is_ok());
        assert!(check_member("../etc/passwd").is_err());
        assert!(check_member("/etc/passwd").is_err());
    }

    #[test]
    fn test_link_checks() {
        assert!(check_link("./current", "bin", false).is_ok());
        assert!(check_link("lib/libagent.so", "libagent.so.1", false).is_ok());
        assert!(check_link("lib/plugins/net.so", "../libnet.so", false).is_ok());
        assert!(check_link("lib/escape", "../../etc", false).is_err());
        assert!(check_link("etc", "/etc", false).is_err());
        assert!(check_link("bin/agent-hard", "bin/agent", true).is_ok());
        assert!(check_link("bin/agent-hard", "../agent", true).is_err());
    }

    #[test]
    fn test_link_target_from_listing() {
        let symlink = "lrwxrwxrwx root/root         0 2026-10-19 15:03 ./etc -> /etc";
        assert_eq!(link_target(symlink, "./etc").unwrap(), Some(("/etc", false)));

        let hard = "hrwxr-xr-x root/root         0 2026-10-19 15:03 ./bin/a2 link to ./bin/agent";
        assert_eq!(link_target(hard, "./bin/a2").unwrap(), Some(("./bin/agent", true)));

        let file = "-rwxr-xr-x root/root      1024 2026-10-19 15:03 ./bin/agent";
        assert_eq!(link_target(file, "./bin/agent").unwrap(), None);
        assert!(link_target(symlink, "./other").is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_escaping_symlink_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        std::fs::create_dir_all(src.join("bin")).unwrap();
        std::fs::write(src.join("bin/agent"), "agent-1.3.0").unwrap();
        std::os::unix::fs::symlink("../../outside", src.join("escape")).unwrap();

        let archive = tmp.path().join("agent-1.3.0.tar.gz");
        let status = std::process::Command::new("tar")
            .arg("-czf")
            .arg(&archive)
            .arg("-C")
            .arg(&src)
            .arg(".")
            .status()
            .unwrap();
        assert!(status.success());

        let dest = tmp.path().join("staging");
        std::fs::create_dir_all(&dest).unwrap();
        assert!(matches!(
            TarExtractor.extract(&archive, &dest).await,
            Err(UpdateError::Extraction(_))
        ));
        assert!(std::fs::symlink_metadata(dest.join("escape")).is_err());
        assert!(!dest.join("bin").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_extract_tar_gz() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        std::fs::create_dir_all(src.join("bin")).unwrap();
        std::fs::write(src.join("bin/agent"), "agent-1.3.0").unwrap();
        std::fs::write(src.join("run.sh"), "#!/bin/sh\n").unwrap();
        std::os::unix::fs::symlink("bin/agent", src.join("current")).unwrap();

        let archive = tmp.path().join("agent-1.3.0.tar.gz");
        let status = std::process::Command::new("tar")
            .arg("-czf")
            .arg(&archive)
            .arg("-C")
            .arg(&src)
            .arg(".")
            .status()
            .unwrap();
        assert!(status.success());

        let dest = tmp.path().join("staging");
        std::fs::create_dir_all(&dest).unwrap();
        TarExtractor.extract(&archive, &dest).await.unwrap();

        assert_eq!(std::fs::read_to_string(dest.join("bin/agent")).unwrap(), "agent-1.3.0");
        assert!(dest.join("run.sh").exists());
        assert_eq!(std::fs::read_to_string(dest.join("current")).unwrap(), "agent-1.3.0");
    }

    #[tokio::test]
    async fn test_unsupported_and_corrupt_archives() {
        let tmp = tempfile::tempdir().unwrap();
        let zip = tmp.path().join("agent.zip");
        std::fs::write(&zip, "PK").unwrap();
        assert!(matches!(
            TarExtractor.extract(&zip, tmp.path()).await,
            Err(UpdateError::Extraction(_))
        ));

        let corrupt = tmp.path().join("agent.tar.gz");
        std::fs::write(&corrupt, "definitely not gzip").unwrap();
        assert!(matches!(
            TarExtractor.extract(&corrupt, tmp.path()).await,
            Err(UpdateError::Extraction(_))
        ));
    }
}
