//! Build root path management
//!
//! This module provides the `BuildPaths` struct which manages all filesystem paths
//! for one project's build root:
//!
//! ```text
//! <build_root>/
//! ├── _permanent/
//! │   └── <storage dir>/            # Durable storage, shared by all releases
//! ├── _application/
//! │   └── <commit id>/              # One directory per release
//! ├── _dependencycache/
//! │   └── <lock hash>/              # Resolved dependency trees
//! ├── _staging/
//! │   └── <commit id>/              # Private scratch area for one run
//! ├── ln-release -> _application/<commit id>   # Relative symlink
//! └── .releasehook.lock             # flock-based locking
//! ```
//!
//! The dependency cache and staging roots can be relocated through the
//! configuration; staging should stay on the same filesystem as `_application`
//! so promotion is a single rename.

use std::io;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

use crate::types::CommitId;

/// Directory holding durable storage, relative to the build root
pub const PERMANENT_DIR: &str = "_permanent";
/// Directory holding releases, relative to the build root
pub const APPLICATION_DIR: &str = "_application";
/// Default dependency cache directory, relative to the build root
pub const DEPENDENCY_CACHE_DIR: &str = "_dependencycache";
/// Default staging directory, relative to the build root
pub const STAGING_DIR: &str = "_staging";
/// Name of the symlink pointing at the live release
pub const CURRENT_LINK: &str = "ln-release";
/// Name of the per-project lock file
pub const LOCK_FILE: &str = ".releasehook.lock";

/// Manages all filesystem paths for the build root layout
#[derive(Debug, Clone)]
pub struct BuildPaths {
    root: PathBuf,
    staging: PathBuf,
    dependency_cache: PathBuf,
}

impl BuildPaths {
    /// Creates a new BuildPaths with default staging and cache locations
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            staging: root.join(STAGING_DIR),
            dependency_cache: root.join(DEPENDENCY_CACHE_DIR),
            root,
        }
    }

    /// Override the staging root
    pub fn with_staging_dir(mut self, staging: impl Into<PathBuf>) -> Self {
        self.staging = staging.into();
        self
    }

    /// Override the dependency cache root
    pub fn with_dependency_cache_dir(mut self, cache: impl Into<PathBuf>) -> Self {
        self.dependency_cache = cache.into();
        self
    }

    /// Returns the build root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the durable storage directory: `{root}/_permanent`
    pub fn permanent_dir(&self) -> PathBuf {
        self.root.join(PERMANENT_DIR)
    }

    /// Returns the durable directory for one storage path: `{root}/_permanent/{relative}`
    pub fn durable_dir(&self, relative: &Path) -> PathBuf {
        self.permanent_dir().join(relative)
    }

    /// Returns the releases directory: `{root}/_application`
    pub fn application_dir(&self) -> PathBuf {
        self.root.join(APPLICATION_DIR)
    }

    /// Returns the release directory: `{root}/_application/{commit}`
    pub fn release_dir(&self, commit: &CommitId) -> PathBuf {
        self.application_dir().join(commit.as_str())
    }

    /// Returns the target written into the current symlink: `_application/{commit}`
    ///
    /// Relative to the directory holding the symlink.
    pub fn release_link_target(&self, commit: &CommitId) -> PathBuf {
        Path::new(APPLICATION_DIR).join(commit.as_str())
    }

    /// Returns the current symlink path: `{root}/ln-release`
    pub fn current_link(&self) -> PathBuf {
        self.root.join(CURRENT_LINK)
    }

    /// Returns the dependency cache root
    pub fn dependency_cache_dir(&self) -> &Path {
        &self.dependency_cache
    }

    /// Returns the staging root
    pub fn staging_dir(&self) -> &Path {
        &self.staging
    }

    /// Returns the lock file path: `{root}/.releasehook.lock`
    pub fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }
}

/// A path from a descriptor or declaration file that may not be joined onto a tree.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnsafePathError {
    #[error("path is empty")]
    Empty,
    #[error("path '{0}' must be relative")]
    Absolute(String),
    #[error("path '{0}' must not contain '..'")]
    ParentComponent(String),
    #[error("path '{0}' contains control characters")]
    ControlCharacter(String),
}

/// Validate a project-relative path and normalise away `.` components.
///
/// `"."` itself is allowed and normalises to an empty path (the tree root).
pub fn validate_relative_path(value: &str) -> Result<PathBuf, UnsafePathError> {
    if value.trim().is_empty() {
        return Err(UnsafePathError::Empty);
    }
    if value.chars().any(|c| c.is_control()) {
        return Err(UnsafePathError::ControlCharacter(value.to_string()));
    }

    let mut normalised = PathBuf::new();
    for component in Path::new(value).components() {
        match component {
            Component::Normal(part) => normalised.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(UnsafePathError::ParentComponent(value.to_string()));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(UnsafePathError::Absolute(value.to_string()));
            }
        }
    }
    Ok(normalised)
}

/// First prefix of `relative` that is a symlink under `root`.
///
/// The walk stops at the first component that does not exist yet.
pub fn symlinked_prefix(root: &Path, relative: &Path) -> io::Result<Option<PathBuf>> {
    let mut prefix = PathBuf::new();
    for component in relative.components() {
        prefix.push(component);
        match std::fs::symlink_metadata(root.join(&prefix)) {
            Ok(meta) if meta.file_type().is_symlink() => return Ok(Some(prefix)),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        }
    }
    Ok(None)
}
