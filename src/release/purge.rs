//! Removal of stale release directories.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PurgeError {
    #[error("failed to list {path}: {source}")]
    List {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Default)]
pub struct PurgeStats {
    pub scanned: u64,
    pub removed: Vec<String>,
    /// Directories that could not be removed, with the reason
    pub failed: Vec<(String, io::Error)>,
}

/// Delete every plain directory under `releases_root` whose name is not in `keep`.
///
/// Symlinks and regular files are never touched. Individual removal failures
/// are collected in the stats rather than stopping the scan.
pub fn purge(releases_root: &Path, keep: &HashSet<String>) -> Result<PurgeStats, PurgeError> {
    let entries = std::fs::read_dir(releases_root).map_err(|source| PurgeError::List {
        path: releases_root.to_path_buf(),
        source,
    })?;

    let mut stats = PurgeStats::default();
    for entry in entries.flatten() {
        stats.scanned += 1;

        // DirEntry::file_type does not follow symlinks
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if !is_dir {
            continue;
        }

        let name = entry.file_name().to_string_lossy().into_owned();
        if keep.contains(&name) {
            continue;
        }

        match std::fs::remove_dir_all(entry.path()) {
            Ok(()) => {
                log::info!("purged release {}", name);
                stats.removed.push(name);
            }
            Err(err) => {
                log::warn!("failed to purge release {}: {}", name, err);
                stats.failed.push((name, err));
            }
        }
    }

    stats.removed.sort();
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::tempdir;

    fn keep(names: &[&str]) -> HashSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn removes_only_unkept_directories() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        for name in ["old1", "old2", "new"] {
            std::fs::create_dir_all(root.join(name).join("src")).unwrap();
        }
        std::fs::write(root.join("notes.txt"), "keep me").unwrap();
        symlink("new", root.join("alias")).unwrap();

        let stats = purge(root, &keep(&["new"])).unwrap();

        assert_eq!(stats.removed, vec!["old1".to_string(), "old2".to_string()]);
        assert!(stats.failed.is_empty());
        assert_eq!(stats.scanned, 5);
        assert!(root.join("new").is_dir());
        assert!(root.join("notes.txt").is_file());
        assert!(root.join("alias").is_symlink());
    }

    #[test]
    fn symlink_to_directory_is_not_followed() {
        let dir = tempdir().unwrap();
        let outside = dir.path().join("outside");
        std::fs::create_dir_all(&outside).unwrap();
        std::fs::write(outside.join("data"), "precious").unwrap();
        let root = dir.path().join("_application");
        std::fs::create_dir_all(&root).unwrap();
        symlink(&outside, root.join("linked")).unwrap();

        let stats = purge(&root, &keep(&[])).unwrap();
        assert!(stats.removed.is_empty());
        assert!(outside.join("data").is_file());
    }

    #[test]
    fn missing_root_is_an_error() {
        let dir = tempdir().unwrap();
        let result = purge(&dir.path().join("missing"), &keep(&[]));
        assert!(matches!(result, Err(PurgeError::List { .. })));
    }
}
