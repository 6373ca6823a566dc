//! Promotion of a staging tree to the live release.
//!
//! The tree is renamed into `_application/<commit>` and `ln-release` is then
//! repointed with an atomic symlink swap, so an observer following the link
//! sees either the previous release or the complete new one.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use super::{Release, live_release};
use crate::paths::BuildPaths;
use crate::swap::atomic_symlink_swap;
use crate::types::CommitId;

/// Errors returned by cutover.
///
/// Everything except [`CutoverError::Link`] leaves the previous release live.
#[derive(Error, Debug)]
pub enum CutoverError {
    #[error("release {0} is already live")]
    AlreadyLive(CommitId),
    #[error("failed to prepare {path}: {source}")]
    Prepare {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to move staging tree to {path}: {source}")]
    Move {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The release is on disk but traffic still goes to the previous one.
    #[error(
        "release {} exists but {} could not be repointed: {source}",
        .release.path.display(),
        .link.display()
    )]
    Link {
        release: Release,
        link: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl CutoverError {
    /// Whether the new release was moved into place.
    pub fn release_on_disk(&self) -> Option<&Release> {
        match self {
            CutoverError::Link { release, .. } => Some(release),
            _ => None,
        }
    }
}

/// Move `staging_tree` to `_application/<commit>` and point `ln-release` at it.
pub fn promote(
    staging_tree: &Path,
    paths: &BuildPaths,
    commit: &CommitId,
) -> Result<Release, CutoverError> {
    let release_dir = paths.release_dir(commit);

    if std::fs::symlink_metadata(&release_dir).is_ok() {
        if live_release(paths).as_deref() == Some(commit.as_str()) {
            return Err(CutoverError::AlreadyLive(commit.clone()));
        }
        log::warn!("replacing stale release directory {}", release_dir.display());
        remove_entry(&release_dir).map_err(|source| CutoverError::Prepare {
            path: release_dir.clone(),
            source,
        })?;
    }

    let releases = paths.application_dir();
    std::fs::create_dir_all(&releases).map_err(|source| CutoverError::Prepare {
        path: releases.clone(),
        source,
    })?;

    std::fs::rename(staging_tree, &release_dir).map_err(|source| CutoverError::Move {
        path: release_dir.clone(),
        source,
    })?;
    log::info!("moved {} to {}", staging_tree.display(), release_dir.display());

    let release = Release {
        commit_id: commit.clone(),
        path: release_dir,
    };

    let link = paths.current_link();
    if let Err(source) = atomic_symlink_swap(&link, &paths.release_link_target(commit)) {
        return Err(CutoverError::Link {
            release,
            link,
            source,
        });
    }
    log::info!("{} now points at {}", link.display(), commit);
    Ok(release)
}

fn remove_entry(path: &Path) -> io::Result<()> {
    let meta = std::fs::symlink_metadata(path)?;
    if meta.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    }
}
