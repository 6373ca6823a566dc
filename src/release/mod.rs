//! Releases under `<build_root>/_application` and the `ln-release` pointer.

pub mod cutover;
pub mod purge;

use std::path::PathBuf;

use crate::paths::BuildPaths;
use crate::swap::{read_symlink_target, resolve_symlink_target};
use crate::types::CommitId;

pub use cutover::{CutoverError, promote};
pub use purge::{PurgeError, PurgeStats, purge};

/// A promoted release directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub commit_id: CommitId,
    pub path: PathBuf,
}

/// Name of the release directory `ln-release` currently points at.
///
/// `None` when the link is missing, dangling, or points outside `_application`.
pub fn live_release(paths: &BuildPaths) -> Option<String> {
    let link = paths.current_link();
    let target = read_symlink_target(&link).ok()??;
    let target = resolve_symlink_target(&link, target);

    let resolved = target.canonicalize().ok()?;
    let releases = paths.application_dir().canonicalize().ok()?;
    if resolved.parent()? != releases {
        return None;
    }
    resolved
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
}
