use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use tracing::warn;
use walkdir::WalkDir;

use crate::backup::BackupResult;
use crate::models::CoreError;

/// Regular file found under an uploads tree.
pub(crate) struct TreeFile {
    pub absolute: PathBuf,
    /// Path relative to the tree root, `/`-separated.
    pub relative: String,
    pub size: u64,
}

/// Files under `root` in a stable (sorted) order. A missing root is empty.
pub(crate) fn tree_files(root: &Path) -> BackupResult<Vec<TreeFile>> {
    if !root.exists() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|error| {
            CoreError::io(format!("failed to walk {}: {error}", root.display()))
        })?;
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            warn!(path = %entry.path().display(), "skipping symlink in uploads tree");
            continue;
        }
        if !file_type.is_file() {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|error| {
                CoreError::internal(format!(
                    "walked path {} outside of {}: {error}",
                    entry.path().display(),
                    root.display()
                ))
            })?
            .components()
            .map(|component| component.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let size = entry
            .metadata()
            .map_err(|error| {
                CoreError::io(format!("failed to stat {}: {error}", entry.path().display()))
            })?
            .len();

        files.push(TreeFile {
            absolute: entry.path().to_path_buf(),
            relative,
            size,
        });
    }
    Ok(files)
}

pub(crate) fn dir_is_empty(path: &Path) -> io::Result<bool> {
    Ok(fs::read_dir(path)?.next().is_none())
}

pub(crate) fn copy_tree(source: &Path, destination: &Path) -> BackupResult<()> {
    fs::create_dir_all(destination).map_err(|error| {
        CoreError::io(format!("failed to create {}: {error}", destination.display()))
    })?;
    for file in tree_files(source)? {
        let target = destination.join(&file.relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|error| {
                CoreError::io(format!("failed to create {}: {error}", parent.display()))
            })?;
        }
        fs::copy(&file.absolute, &target).map_err(|error| {
            CoreError::io(format!(
                "failed to copy {} to {}: {error}",
                file.absolute.display(),
                target.display()
            ))
        })?;
    }
    Ok(())
}

/// Removes every entry inside `path` but keeps the directory itself.
pub(crate) fn clear_dir(path: &Path) -> io::Result<()> {
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

/// Relative path of an archive entry below `prefix`, or `None` when the
/// remainder is empty or would resolve outside the extraction root.
pub(crate) fn contained_relative_path(entry_name: &str, prefix: &str) -> Option<PathBuf> {
    let remainder = entry_name.strip_prefix(prefix)?;
    if remainder.contains('\\') {
        return None;
    }

    let mut relative = PathBuf::new();
    for component in Path::new(remainder).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if relative.as_os_str().is_empty() {
        return None;
    }
    Some(relative)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn symlinks_are_left_out_of_the_tree() {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_nanos();
        let root = std::env::temp_dir().join(format!("markdesk-tree-symlink-{nanos}"));
        fs::create_dir_all(root.join("submission1")).unwrap();
        fs::write(root.join("submission1").join("essay.txt"), "essay").unwrap();
        std::os::unix::fs::symlink(
            root.join("submission1").join("essay.txt"),
            root.join("linked.txt"),
        )
        .unwrap();

        let files = tree_files(&root).unwrap();
        let relative: Vec<&str> = files.iter().map(|file| file.relative.as_str()).collect();
        assert_eq!(relative, vec!["submission1/essay.txt"]);

        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn contained_paths_stay_below_prefix() {
        assert_eq!(
            contained_relative_path("uploads/submission1/document.txt", "uploads/"),
            Some(PathBuf::from("submission1").join("document.txt"))
        );
        assert_eq!(
            contained_relative_path("uploads/./a.txt", "uploads/"),
            Some(PathBuf::from("a.txt"))
        );
    }

    #[test]
    fn escaping_or_empty_paths_are_refused() {
        assert_eq!(contained_relative_path("uploads/../evil.txt", "uploads/"), None);
        assert_eq!(contained_relative_path("uploads//etc/passwd", "uploads/"), None);
        assert_eq!(contained_relative_path("uploads/..\\evil.txt", "uploads/"), None);
        assert_eq!(contained_relative_path("uploads/", "uploads/"), None);
        assert_eq!(contained_relative_path("database.sqlite", "uploads/"), None);
    }
}
