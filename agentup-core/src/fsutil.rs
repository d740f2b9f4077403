//! Filesystem helpers shared by the backup manager and the installer.

use std::ffi::OsString;
use std::io;
use std::path::{Component, Path};

use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Recursively copy a directory.
pub(crate) async fn copy_dir_recursive(src: &Path, dest: &Path) -> io::Result<()> {
    fs::create_dir_all(dest).await?;

    let mut entries = fs::read_dir(src).await?;
    while let Some(entry) = entries.next_entry().await? {
        let entry_path = entry.path();
        let dest_path = dest.join(entry.file_name());

        if entry.file_type().await?.is_dir() {
            Box::pin(copy_dir_recursive(&entry_path, &dest_path)).await?;
        } else {
            fs::copy(&entry_path, &dest_path).await?;
        }
    }

    Ok(())
}

/// Copy a file or directory tree to `dest`, creating parent directories.
pub(crate) async fn copy_path(src: &Path, dest: &Path) -> io::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }

    let meta = fs::metadata(src).await?;
    if meta.is_dir() {
        copy_dir_recursive(src, dest).await
    } else {
        fs::copy(src, dest).await.map(|_| ())
    }
}

/// Remove a file or directory tree. Missing paths are not an error.
pub(crate) async fn remove_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).await,
        Ok(_) => fs::remove_file(path).await,
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Move `src` to `dest`, falling back to copy-then-delete when a rename
/// crosses filesystems.
pub(crate) async fn move_path(src: &Path, dest: &Path) -> io::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }

    match fs::rename(src, dest).await {
        Ok(()) => Ok(()),
        Err(_) => {
            copy_path(src, dest).await?;
            remove_path(src).await
        }
    }
}

/// Write `contents` to `path` through a temporary sibling and a rename, so
/// readers see either the old or the new contents.
pub(crate) async fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let mut tmp_name = path.file_name().map(OsString::from).unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    let mut file = fs::File::create(&tmp_path).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(&tmp_path, path).await
}

/// Names of the entries directly inside `dir`, sorted. Missing directories
/// have no entries.
pub(crate) async fn list_entries(dir: &Path) -> io::Result<Vec<OsString>> {
    let mut names = Vec::new();
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(names),
        Err(e) => return Err(e),
    };

    while let Some(entry) = entries.next_entry().await? {
        names.push(entry.file_name());
    }
    names.sort();
    Ok(names)
}

/// Whether `path` is a single plain file name such as `.credentials`.
pub fn is_top_level_name(path: &Path) -> bool {
    let mut components = path.components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_is_top_level_name() {
        assert!(is_top_level_name(Path::new(".credentials")));
        assert!(is_top_level_name(Path::new("identity.json")));
        assert!(!is_top_level_name(Path::new("conf/identity.json")));
        assert!(!is_top_level_name(Path::new("/etc/passwd")));
        assert!(!is_top_level_name(Path::new("..")));
        assert!(!is_top_level_name(&PathBuf::new()));
    }

    #[tokio::test]
    async fn test_move_and_copy_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("nested")).await.unwrap();
        fs::write(src.join("nested/file.txt"), b"payload").await.unwrap();

        let copy = tmp.path().join("copy");
        copy_path(&src, &copy).await.unwrap();
        assert_eq!(fs::read(copy.join("nested/file.txt")).await.unwrap(), b"payload");

        let moved = tmp.path().join("deeper/moved");
        move_path(&src, &moved).await.unwrap();
        assert!(!src.exists());
        assert_eq!(fs::read(moved.join("nested/file.txt")).await.unwrap(), b"payload");

        remove_path(&moved).await.unwrap();
        remove_path(&moved).await.unwrap();
        assert!(!moved.exists());
    }

    #[tokio::test]
    async fn test_write_atomic_replaces_contents() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state/session.json");
        write_atomic(&path, b"one").await.unwrap();
        write_atomic(&path, b"two").await.unwrap();
        assert_eq!(fs::read(&path).await.unwrap(), b"two");
        assert_eq!(list_entries(path.parent().unwrap()).await.unwrap(), vec![OsString::from("session.json")]);
    }
}
