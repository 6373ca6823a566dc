//! Pre-promotion validation of a pushed commit.
//!
//! Only the descriptor file is checked out, into a throwaway directory, so a
//! broken push is rejected before any staging resources exist.

use std::path::Path;

use thiserror::Error;

use crate::descriptor::{BuildDescriptor, DescriptorError};
use crate::git::GitCli;
use crate::types::CommitId;

/// Reasons a push is rejected by the gate.
#[derive(Error, Debug)]
pub enum GateError {
    #[error("{file} could not be checked out: {reason}")]
    MissingDescriptor { file: String, reason: String },
    #[error("{file} is invalid: {source}")]
    InvalidDescriptor {
        file: String,
        #[source]
        source: DescriptorError,
    },
    #[error("{file} does not define project.name")]
    MissingProjectName { file: String },
}

/// Check out and parse the descriptor of `commit`.
pub fn check(
    git: &GitCli<'_>,
    git_dir: &Path,
    commit: &CommitId,
    descriptor_file: &str,
) -> Result<BuildDescriptor, GateError> {
    let missing = |reason: String| GateError::MissingDescriptor {
        file: descriptor_file.to_string(),
        reason,
    };

    let scratch = tempfile::Builder::new()
        .prefix("releasehook-gate-")
        .tempdir()
        .map_err(|e| missing(format!("cannot create scratch directory: {e}")))?;
    let work_tree = scratch.path().join("tree");
    let index_file = scratch.path().join("index");

    git.checkout_paths(git_dir, &work_tree, &index_file, commit, &[descriptor_file])
        .map_err(|e| missing(e.to_string()))?;

    let descriptor = BuildDescriptor::from_file(&work_tree.join(descriptor_file)).map_err(
        |source| match source {
            DescriptorError::Read { source, .. } => missing(source.to_string()),
            source => GateError::InvalidDescriptor {
                file: descriptor_file.to_string(),
                source,
            },
        },
    )?;

    if descriptor.project_name().is_none() {
        return Err(GateError::MissingProjectName {
            file: descriptor_file.to_string(),
        });
    }

    log::debug!(
        "gate passed for {} (project {:?})",
        commit.short(),
        descriptor.project_name()
    );
    Ok(descriptor)
}
