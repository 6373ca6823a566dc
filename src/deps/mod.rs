//! Dependency resolution through the content-addressed cache.
//!
//! The lock file's hash names the cache entry. On a miss the external tool
//! runs once in the staging working directory and its output directory is
//! moved into the cache; on a hit the tool is not run at all. Either way the
//! release only contains a symlink to the cache entry.

pub mod cache;
pub mod lockfile;

use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::config::DependencyConfig;
use crate::descriptor::{BuildDescriptor, DescriptorError};
use crate::paths::symlinked_prefix;
use crate::process::{CommandSpec, ProcessError, ProcessRunner};
use crate::report::Reporter;

pub use cache::{CacheError, DependencyCache, InsertOutcome};
pub use lockfile::{CacheKey, LockfileError};

/// Errors returned while resolving dependencies. Every variant aborts the run.
#[derive(Error, Debug)]
pub enum DependencyError {
    #[error("invalid dependency declaration: {0}")]
    Descriptor(#[from] DescriptorError),
    #[error("dependency working directory {0} does not exist")]
    MissingWorkingDir(PathBuf),
    #[error("dependency working directory passes through the symlink {0}")]
    SymlinkedWorkingDir(PathBuf),
    #[error("dependency manifest {0} not found")]
    MissingManifest(PathBuf),
    #[error("dependency lock file {0} not found")]
    MissingLockFile(PathBuf),
    #[error(transparent)]
    Lockfile(#[from] LockfileError),
    #[error("dependency tool could not run: {0}")]
    Tool(#[from] ProcessError),
    #[error("dependency installation failed ({0})")]
    InstallFailed(String),
    #[error("dependency tool finished but {0} was not created")]
    MissingOutput(PathBuf),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("failed to {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// What dependency resolution did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The descriptor declares no working directory.
    Skipped,
    /// The entry existed; the tool was not run.
    CacheHit { key: CacheKey, entry: PathBuf },
    /// The tool ran and its output became (or was superseded by) the entry.
    Installed { key: CacheKey, entry: PathBuf },
}

/// Dependency tool invocation settings for one run.
pub struct Resolver<'a> {
    config: &'a DependencyConfig,
    cache: DependencyCache,
    runner: &'a dyn ProcessRunner,
    timeout: Duration,
}

impl<'a> Resolver<'a> {
    pub fn new(
        config: &'a DependencyConfig,
        cache: DependencyCache,
        runner: &'a dyn ProcessRunner,
        timeout: Duration,
    ) -> Self {
        Self {
            config,
            cache,
            runner,
            timeout,
        }
    }

    /// Resolve dependencies for the checkout in `staging_tree`.
    pub fn resolve(
        &self,
        staging_tree: &Path,
        descriptor: &BuildDescriptor,
        reporter: &dyn Reporter,
    ) -> Result<Resolution, DependencyError> {
        let Some(relative) = descriptor.dependency_working_dir()? else {
            reporter.detail("No dependency working directory declared, skipping");
            return Ok(Resolution::Skipped);
        };

        let working_dir = staging_tree.join(&relative);
        match symlinked_prefix(staging_tree, &relative) {
            Ok(None) => {}
            Ok(Some(link)) => return Err(DependencyError::SymlinkedWorkingDir(link)),
            Err(source) => {
                return Err(DependencyError::Io {
                    action: "inspect",
                    path: working_dir,
                    source,
                });
            }
        }
        if !working_dir.is_dir() {
            return Err(DependencyError::MissingWorkingDir(relative));
        }
        let manifest = working_dir.join(&self.config.manifest);
        if !manifest.is_file() {
            return Err(DependencyError::MissingManifest(
                relative.join(&self.config.manifest),
            ));
        }
        let lock_file = working_dir.join(&self.config.lock_file);
        if !lock_file.is_file() {
            return Err(DependencyError::MissingLockFile(
                relative.join(&self.config.lock_file),
            ));
        }

        let key = lockfile::read_cache_key(&lock_file, &self.config.hash_field)?;
        let output_dir = working_dir.join(&self.config.output_dir);

        let resolution = match self.cache.lookup(&key) {
            Some(entry) => {
                reporter.detail(&format!("Dependency cache hit for {key}"));
                Resolution::CacheHit { key, entry }
            }
            None => {
                reporter.detail(&format!(
                    "No cached dependencies for {key}, running {}",
                    self.config.command.join(" ")
                ));
                let entry = self.install(&key, &working_dir, &output_dir, reporter)?;
                Resolution::Installed { key, entry }
            }
        };

        let entry = match &resolution {
            Resolution::CacheHit { entry, .. } | Resolution::Installed { entry, .. } => entry,
            Resolution::Skipped => return Ok(resolution),
        };
        link_output(&output_dir, entry)?;
        reporter.detail(&format!(
            "{} -> {}",
            relative.join(&self.config.output_dir).display(),
            entry.display()
        ));
        Ok(resolution)
    }

    fn install(
        &self,
        key: &CacheKey,
        working_dir: &Path,
        output_dir: &Path,
        reporter: &dyn Reporter,
    ) -> Result<PathBuf, DependencyError> {
        let (program, args) = match self.config.command.split_first() {
            Some(split) => split,
            None => return Err(DependencyError::InstallFailed("no command configured".into())),
        };
        let command = CommandSpec::new(program)
            .args(args)
            .current_dir(working_dir)
            .timeout(self.timeout);

        let output = self
            .runner
            .run_streaming(&command, &mut |line| reporter.output(line))?;
        if !output.success() {
            return Err(DependencyError::InstallFailed(output.failure_summary()));
        }
        if !output_dir.is_dir() {
            return Err(DependencyError::MissingOutput(output_dir.to_path_buf()));
        }

        let outcome = self.cache.insert(key, output_dir)?;
        if let InsertOutcome::AlreadyPresent(entry) = &outcome {
            log::warn!(
                "dependency cache entry {} appeared during install; using it",
                entry.display()
            );
        }
        Ok(outcome.entry().to_path_buf())
    }
}

/// Replace whatever is at `output_dir` with a symlink to `entry`.
fn link_output(output_dir: &Path, entry: &Path) -> Result<(), DependencyError> {
    let io_error = |action: &'static str| {
        move |source: io::Error| DependencyError::Io {
            action,
            path: output_dir.to_path_buf(),
            source,
        }
    };

    match std::fs::symlink_metadata(output_dir) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(output_dir).map_err(io_error("remove"))?,
        Ok(_) => std::fs::remove_file(output_dir).map_err(io_error("remove"))?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(io_error("inspect")(e)),
    }
    if let Some(parent) = output_dir.parent() {
        std::fs::create_dir_all(parent).map_err(io_error("create parent of"))?;
    }
    symlink(entry, output_dir).map_err(io_error("symlink"))
}
