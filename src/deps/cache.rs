//! Content-addressed dependency cache
//!
//! ```text
//! <cache root>/
//! ├── <lock hash>/            # one resolved dependency tree per hash
//! └── <project>/<lock hash>/  # when namespaced by project
//! ```
//!
//! Entries are written once by renaming a freshly built directory into place
//! and are never modified or deleted afterwards.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use super::lockfile::CacheKey;

/// Errors returned by cache operations.
#[derive(Error, Debug)]
pub enum CacheError {
    /// An underlying IO operation failed.
    #[error("failed to {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Result of inserting a built directory into the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The built directory became the entry.
    Inserted(PathBuf),
    /// Another run inserted the same key first; the built copy was discarded.
    AlreadyPresent(PathBuf),
}

impl InsertOutcome {
    pub fn entry(&self) -> &Path {
        match self {
            InsertOutcome::Inserted(path) | InsertOutcome::AlreadyPresent(path) => path,
        }
    }
}

/// Cache of resolved dependency trees keyed by lock hash.
#[derive(Debug, Clone)]
pub struct DependencyCache {
    root: PathBuf,
}

impl DependencyCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Scope entries under a per-project subdirectory.
    pub fn namespaced(self, project: &str) -> Self {
        Self {
            root: self.root.join(project_namespace(project)),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the entry for `key`, whether or not it exists.
    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.as_str())
    }

    /// Existing entry for `key`.
    pub fn lookup(&self, key: &CacheKey) -> Option<PathBuf> {
        let entry = self.entry_path(key);
        entry.is_dir().then_some(entry)
    }

    /// Move `built` into the cache as the entry for `key`.
    ///
    /// `built` must be on the same filesystem as the cache root. If the entry
    /// appeared in the meantime, `built` is removed and the existing entry wins.
    pub fn insert(&self, key: &CacheKey, built: &Path) -> Result<InsertOutcome, CacheError> {
        std::fs::create_dir_all(&self.root).map_err(|source| CacheError::Io {
            action: "create",
            path: self.root.clone(),
            source,
        })?;

        let entry = self.entry_path(key);
        if entry.is_dir() {
            discard(built);
            return Ok(InsertOutcome::AlreadyPresent(entry));
        }

        match std::fs::rename(built, &entry) {
            Ok(()) => {
                log::info!("inserted dependency cache entry {}", entry.display());
                Ok(InsertOutcome::Inserted(entry))
            }
            // Lost a race with a concurrent insert of the same key
            Err(_) if entry.is_dir() => {
                discard(built);
                Ok(InsertOutcome::AlreadyPresent(entry))
            }
            Err(source) => Err(CacheError::Io {
                action: "move into cache",
                path: built.to_path_buf(),
                source,
            }),
        }
    }
}

/// Directory name for a project's namespace.
pub fn project_namespace(project: &str) -> String {
    let name: String = project
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.is_empty() || name.chars().all(|c| c == '.') {
        "_".to_string()
    } else {
        name
    }
}

fn discard(built: &Path) {
    if let Err(e) = std::fs::remove_dir_all(built) {
        log::warn!("failed to discard {}: {}", built.display(), e);
    }
}
