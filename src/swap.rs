//! Atomic symlink swapping for release cutover.

use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Global counter for unique temp link names within a process
static SWAP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Atomically point `link_path` at `new_target`, replacing any existing link.
///
/// Creates a temp symlink next to `link_path`, then renames it over the old
/// one. The rename is atomic on POSIX, so readers see either the previous
/// target or the new one, never a missing link.
///
/// `new_target` is written verbatim; a relative target is resolved by the OS
/// against the directory containing `link_path`.
pub fn atomic_symlink_swap(link_path: &Path, new_target: &Path) -> io::Result<()> {
    loop {
        // {link_path}.tmp.{pid}.{counter}; retry if a stale one survived a crash
        let counter = SWAP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let unique_id = format!("{}.{}", std::process::id(), counter);
        let temp_path = temp_link_path(link_path, &unique_id);

        match symlink(new_target, &temp_path) {
            Ok(()) => {
                if let Err(e) = std::fs::rename(&temp_path, link_path) {
                    let _ = std::fs::remove_file(&temp_path);
                    return Err(e);
                }

                return Ok(());
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Read the target of a symlink, returning None if it doesn't exist.
pub fn read_symlink_target(link_path: &Path) -> io::Result<Option<PathBuf>> {
    match std::fs::read_link(link_path) {
        Ok(target) => Ok(Some(target)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Resolve a symlink target read from `link_path` into a usable path.
pub fn resolve_symlink_target(link_path: &Path, target: PathBuf) -> PathBuf {
    if target.is_absolute() {
        target
    } else if let Some(parent) = link_path.parent() {
        parent.join(&target)
    } else {
        target
    }
}

fn temp_link_path(link_path: &Path, unique_id: &str) -> PathBuf {
    // Not `with_extension`: "ln-release" has none, but a dotted name would lose it
    let mut name = link_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".tmp.{unique_id}"));
    link_path.with_file_name(name)
}
