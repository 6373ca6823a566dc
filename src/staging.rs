//! Private per-commit working directories.
//!
//! ```text
//! <staging root>/<commit id>/
//! ├── tree/     # materialized commit, later renamed into _application/
//! └── index     # private GIT_INDEX_FILE for the checkout
//! ```
//!
//! The area is removed when the [`StagingArea`] is dropped, whether the run
//! was promoted, aborted or panicked.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::git::{GitCli, GitError};
use crate::process::OutputLine;
use crate::types::CommitId;

const TREE_DIR: &str = "tree";
const INDEX_FILE: &str = "index";

/// Errors returned while preparing the staging area.
#[derive(Error, Debug)]
pub enum StagingError {
    #[error("failed to prepare staging directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to check out the pushed commit: {0}")]
    Checkout(#[from] GitError),
}

/// An exclusive scratch directory for one commit.
#[derive(Debug)]
pub struct StagingArea {
    root: PathBuf,
    tree: PathBuf,
    index: PathBuf,
    commit: CommitId,
}

impl StagingArea {
    /// Allocate `<staging_root>/<commit>`, clearing leftovers of an interrupted run.
    ///
    /// Callers hold the project lock, so nothing else can be using the directory.
    pub fn allocate(staging_root: &Path, commit: &CommitId) -> Result<Self, StagingError> {
        let root = staging_root.join(commit.as_str());
        if root.exists() {
            log::warn!("removing stale staging directory {}", root.display());
            std::fs::remove_dir_all(&root).map_err(|source| StagingError::Io {
                path: root.clone(),
                source,
            })?;
        }

        let tree = root.join(TREE_DIR);
        std::fs::create_dir_all(&tree).map_err(|source| StagingError::Io {
            path: tree.clone(),
            source,
        })?;

        log::debug!("allocated staging area {}", root.display());
        Ok(Self {
            index: root.join(INDEX_FILE),
            root,
            tree,
            commit: commit.clone(),
        })
    }

    /// Directory holding the materialized tree.
    pub fn tree(&self) -> &Path {
        &self.tree
    }

    /// Check the full commit out of `git_dir` into the staging tree.
    pub fn materialize(
        &self,
        git: &GitCli<'_>,
        git_dir: &Path,
        sink: &mut dyn FnMut(&OutputLine),
    ) -> Result<(), StagingError> {
        git.checkout_tree(git_dir, &self.tree, &self.index, &self.commit, sink)?;
        Ok(())
    }
}

impl Drop for StagingArea {
    fn drop(&mut self) {
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => log::debug!("removed staging area {}", self.root.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => log::warn!(
                "failed to remove staging area {}: {}",
                self.root.display(),
                e
            ),
        }
    }
}
