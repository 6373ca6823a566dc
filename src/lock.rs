//! Per-project mutual exclusion.
//!
//! Two pushes to the same project must not race on the dependency cache
//! insert or on the `ln-release` swap, so a run holds an exclusive `flock`
//! on `<build_root>/.releasehook.lock` until it finishes. The holder writes
//! its pid into the file so a waiting push can say who it is waiting for.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use fs2::FileExt;

const MAX_BACKOFF: Duration = Duration::from_millis(500);

/// Exclusive lock on a build root, released on drop.
#[derive(Debug)]
pub struct ProjectLock {
    file: File,
}

impl ProjectLock {
    /// Take the lock, waiting up to `timeout` for a concurrent run to finish.
    ///
    /// Fails with `ErrorKind::TimedOut` when the lock is still held afterwards.
    pub fn acquire(lock_path: &Path, timeout: Duration) -> io::Result<Self> {
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)?;

        let start = Instant::now();
        let mut backoff = Duration::from_millis(10);
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if start.elapsed() >= timeout {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!(
                                "deploy {} still holds {} after {:?}",
                                holder(&mut file),
                                lock_path.display(),
                                timeout
                            ),
                        ));
                    }
                    log::debug!("waiting for {} ({})", lock_path.display(), holder(&mut file));
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(e) => return Err(e),
            }
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", std::process::id())?;
        log::debug!("took {}", lock_path.display());
        Ok(Self { file })
    }
}

impl Drop for ProjectLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Description of the current holder from the pid it recorded.
fn holder(file: &mut File) -> String {
    let mut contents = String::new();
    let read = file
        .seek(SeekFrom::Start(0))
        .and_then(|_| file.read_to_string(&mut contents));
    match read {
        Ok(_) if !contents.trim().is_empty() => format!("pid {}", contents.trim()),
        _ => "of another process".to_string(),
    }
}
