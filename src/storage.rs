//! Binding durable storage into a staging tree.
//!
//! Each path in the descriptor's `storage.dirs` is replaced inside the staging
//! tree by a symlink to `<build_root>/_permanent/<path>`, which outlives every
//! release. Version-controlled content at those paths is discarded.

use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::descriptor::{BuildDescriptor, DescriptorError};
use crate::paths::{BuildPaths, symlinked_prefix};
use crate::report::Reporter;

/// Errors returned while binding storage. Every variant aborts the run.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("invalid storage declaration: {0}")]
    Descriptor(#[from] DescriptorError),
    #[error("'{path}' passes through a symlink inside the checkout")]
    SymlinkAncestor { path: PathBuf },
    #[error("failed to {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// One bound storage directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageBinding {
    pub relative_path: PathBuf,
    pub durable_path: PathBuf,
    /// The durable directory did not exist before this run
    pub created: bool,
}

/// Bind every declared storage directory into `staging_tree`.
///
/// An absent `storage.dirs` is reported as a warning and binds nothing.
pub fn bind(
    staging_tree: &Path,
    descriptor: &BuildDescriptor,
    paths: &BuildPaths,
    reporter: &dyn Reporter,
) -> Result<Vec<StorageBinding>, StorageError> {
    let Some(dirs) = descriptor.storage_dirs()? else {
        reporter.warn("No persistent storage declared (storage.dirs)");
        return Ok(Vec::new());
    };

    let mut bindings = Vec::with_capacity(dirs.len());
    for relative in dirs {
        let durable = paths.durable_dir(&relative);
        let created = bind_dir(staging_tree, &relative, &durable)?;
        if created {
            reporter.detail(&format!("Added permanent storage {}", relative.display()));
        }
        reporter.detail(&format!(
            "{} -> {}",
            relative.display(),
            durable.display()
        ));
        bindings.push(StorageBinding {
            relative_path: relative,
            durable_path: durable,
            created,
        });
    }
    Ok(bindings)
}

/// Replace `staging_tree/relative` with a symlink to `durable`.
///
/// Order: clear the staged path, ensure the durable directory, then link.
/// Returns whether the durable directory had to be created. Re-entrant.
pub fn bind_dir(staging_tree: &Path, relative: &Path, durable: &Path) -> Result<bool, StorageError> {
    ensure_no_symlink_ancestors(staging_tree, relative)?;
    let staged = staging_tree.join(relative);

    match std::fs::symlink_metadata(&staged) {
        Ok(meta) if meta.is_dir() => {
            std::fs::remove_dir_all(&staged).map_err(io_error("remove", &staged))?
        }
        Ok(_) => std::fs::remove_file(&staged).map_err(io_error("remove", &staged))?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(io_error("inspect", &staged)(e)),
    }

    let created = !durable.is_dir();
    std::fs::create_dir_all(durable).map_err(io_error("create", durable))?;

    if let Some(parent) = staged.parent() {
        std::fs::create_dir_all(parent).map_err(io_error("create", parent))?;
    }
    symlink(durable, &staged).map_err(io_error("symlink", &staged))?;

    log::debug!("bound {} -> {}", staged.display(), durable.display());
    Ok(created)
}

/// Removing `a/b` when the checkout made `a` a symlink would delete outside the tree.
fn ensure_no_symlink_ancestors(staging_tree: &Path, relative: &Path) -> Result<(), StorageError> {
    let Some(parent) = relative.parent() else {
        return Ok(());
    };
    match symlinked_prefix(staging_tree, parent) {
        Ok(None) => Ok(()),
        Ok(Some(_)) => Err(StorageError::SymlinkAncestor {
            path: relative.to_path_buf(),
        }),
        Err(e) => Err(io_error("inspect", &staging_tree.join(parent))(e)),
    }
}

fn io_error<'a>(
    action: &'static str,
    path: &'a Path,
) -> impl FnOnce(io::Error) -> StorageError + 'a {
    move |source| StorageError::Io {
        action,
        path: path.to_path_buf(),
        source,
    }
}
