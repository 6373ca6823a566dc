//! The release pipeline controller.
//!
//! Stages run strictly in order: gate, checkout, submodules, storage,
//! dependencies, cutover, purge, restart. Every stage returns a `Result`; the
//! controller alone decides what is fatal. Failures before cutover abort the
//! run and leave the live release untouched. Failures after cutover become
//! [`Warning`]s, since the new release is already being served.

use std::collections::HashSet;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::config::HookConfig;
use crate::deps::{DependencyCache, DependencyError, Resolution, Resolver};
use crate::descriptor::BuildDescriptor;
use crate::gate::{self, GateError};
use crate::git::GitCli;
use crate::lock::ProjectLock;
use crate::paths::BuildPaths;
use crate::process::ProcessRunner;
use crate::release::{self, CutoverError, Release, live_release};
use crate::report::Reporter;
use crate::restart::{self, RestartError};
use crate::staging::{StagingArea, StagingError};
use crate::storage::{self, StorageError};
use crate::submodule::{self, SubmoduleError};
use crate::types::PushEvent;

/// Why a run stopped before cutover. The previous release stays live.
#[derive(Error, Debug)]
pub enum AbortReason {
    #[error("could not lock the build root: {0}")]
    Lock(#[source] io::Error),
    #[error("could not prepare {path}: {source}")]
    Scaffold {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Staging(#[from] StagingError),
    #[error("submodule resolution failed: {0}")]
    Submodule(#[from] SubmoduleError),
    #[error("persistent storage binding failed: {0}")]
    StorageBind(#[from] StorageError),
    #[error("dependency resolution failed: {0}")]
    Dependency(#[from] DependencyError),
    #[error("cutover failed: {0}")]
    Cutover(#[source] CutoverError),
}

/// A problem after cutover. The run still counts as deployed.
#[derive(Error, Debug)]
pub enum Warning {
    #[error("{0}; traffic is still served by the previous release")]
    CurrentLinkNotUpdated(#[source] CutoverError),
    #[error("failed to purge old releases: {0}")]
    Purge(String),
    #[error("restart failed: {0}")]
    Restart(#[source] RestartError),
}

/// Result of handling one push event.
#[derive(Debug)]
pub enum RunOutcome {
    /// Not a deployable push; nothing was touched.
    Ignored(String),
    /// The gate accepted the push (pre-receive only).
    Validated { project: String },
    /// The gate rejected the push.
    Rejected(GateError),
    /// A stage failed before cutover.
    Aborted(AbortReason),
    /// The release was promoted, possibly with warnings.
    Deployed {
        release: Release,
        warnings: Vec<Warning>,
    },
}

impl RunOutcome {
    /// Process exit status for this outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Ignored(_) | RunOutcome::Validated { .. } | RunOutcome::Deployed { .. } => 0,
            RunOutcome::Rejected(_) => 1,
            RunOutcome::Aborted(_) => 2,
        }
    }
}

/// Everything a run needs, shared by reference with every stage.
pub struct PipelineContext<'a> {
    pub event: &'a PushEvent,
    pub config: &'a HookConfig,
    pub paths: BuildPaths,
    pub runner: &'a dyn ProcessRunner,
    pub reporter: &'a dyn Reporter,
}

impl<'a> PipelineContext<'a> {
    pub fn new(
        event: &'a PushEvent,
        config: &'a HookConfig,
        runner: &'a dyn ProcessRunner,
        reporter: &'a dyn Reporter,
    ) -> Self {
        Self {
            event,
            config,
            paths: config.build_paths(),
            runner,
            reporter,
        }
    }

    fn git(&self) -> GitCli<'a> {
        GitCli::new(self.runner, self.config.timeouts.git())
    }

    /// Reason to skip this event, if any.
    fn ignore_reason(&self) -> Option<String> {
        if self.event.is_deletion() {
            return Some(format!("{} was deleted", self.event.ref_name));
        }
        let branch = self.event.branch_name();
        if branch != self.config.deployable_branch {
            return Some(format!(
                "push to '{}' ignored; only '{}' is deployed",
                branch, self.config.deployable_branch
            ));
        }
        None
    }

    fn gate(&self) -> Result<BuildDescriptor, GateError> {
        self.reporter.step(&format!(
            "Validating {} at {}",
            self.config.descriptor_file,
            self.event.new_commit.short()
        ));
        gate::check(
            &self.git(),
            &self.config.git_dir,
            &self.event.new_commit,
            &self.config.descriptor_file,
        )
    }
}

/// Run only the gate, for the pre-receive hook.
pub fn validate(ctx: &PipelineContext<'_>) -> RunOutcome {
    if let Some(reason) = ctx.ignore_reason() {
        log::info!("{}", reason);
        return RunOutcome::Ignored(reason);
    }

    match ctx.gate() {
        Ok(descriptor) => {
            let project = descriptor.project_name().unwrap_or_default().to_string();
            ctx.reporter.detail(&format!("Project {project} looks deployable"));
            RunOutcome::Validated { project }
        }
        Err(err) => {
            ctx.reporter.abort(&err.to_string());
            RunOutcome::Rejected(err)
        }
    }
}

/// Run the complete pipeline for one push event.
pub fn run(ctx: &PipelineContext<'_>) -> RunOutcome {
    if let Some(reason) = ctx.ignore_reason() {
        log::info!("{}", reason);
        return RunOutcome::Ignored(reason);
    }

    let descriptor = match ctx.gate() {
        Ok(descriptor) => descriptor,
        Err(err) => {
            log::warn!("gate rejected {}: {}", ctx.event.new_commit, err);
            ctx.reporter.abort(&err.to_string());
            return RunOutcome::Rejected(err);
        }
    };
    let project = descriptor.project_name().unwrap_or_default().to_string();
    ctx.reporter.detail(&format!("Deploying project {project}"));

    let mut warnings = Vec::new();
    match deploy(ctx, &descriptor, &project, &mut warnings) {
        Ok(release) => {
            for warning in &warnings {
                log::warn!("{}", warning);
            }
            if warnings.is_empty() {
                ctx.reporter.success(&format!(
                    "Deployed {} at {}",
                    project,
                    release.commit_id.short()
                ));
            } else {
                ctx.reporter.success(&format!(
                    "Deployed {} at {} with {} warning(s)",
                    project,
                    release.commit_id.short(),
                    warnings.len()
                ));
            }
            RunOutcome::Deployed { release, warnings }
        }
        Err(reason) => {
            log::error!("deploy of {} aborted: {}", ctx.event.new_commit, reason);
            ctx.reporter.abort(&reason.to_string());
            RunOutcome::Aborted(reason)
        }
    }
}

fn deploy(
    ctx: &PipelineContext<'_>,
    descriptor: &BuildDescriptor,
    project: &str,
    warnings: &mut Vec<Warning>,
) -> Result<Release, AbortReason> {
    let reporter = ctx.reporter;
    let commit = &ctx.event.new_commit;
    let git = ctx.git();

    let _lock = ProjectLock::acquire(&ctx.paths.lock_path(), ctx.config.timeouts.lock())
        .map_err(AbortReason::Lock)?;
    scaffold(&ctx.paths)?;

    if live_release(&ctx.paths).as_deref() == Some(commit.as_str()) {
        return Err(AbortReason::Cutover(CutoverError::AlreadyLive(commit.clone())));
    }

    reporter.step(&format!("Checking out {}", commit.short()));
    let staging = StagingArea::allocate(ctx.paths.staging_dir(), commit)?;
    staging.materialize(&git, &ctx.config.git_dir, &mut |line| reporter.output(line))?;

    reporter.step("Resolving submodules");
    submodule::resolve(&git, &ctx.config.git_dir, commit, staging.tree(), reporter)?;

    reporter.step("Binding persistent storage");
    storage::bind(staging.tree(), descriptor, &ctx.paths, reporter)?;

    reporter.step("Resolving dependencies");
    let mut cache = DependencyCache::new(ctx.paths.dependency_cache_dir());
    if ctx.config.namespace_cache_by_project {
        cache = cache.namespaced(project);
    }
    let resolver = Resolver::new(
        &ctx.config.dependency,
        cache,
        ctx.runner,
        ctx.config.timeouts.dependency(),
    );
    let resolution = resolver.resolve(staging.tree(), descriptor, reporter)?;
    log::info!("dependency resolution for {}: {:?}", commit, resolution);
    if let Resolution::Installed { key, .. } = &resolution {
        reporter.detail(&format!("Cached dependencies as {key}"));
    }

    reporter.step("Promoting release");
    let (release, live) = match release::promote(staging.tree(), &ctx.paths, commit) {
        Ok(release) => {
            reporter.detail(&format!(
                "ln-release -> {}",
                ctx.paths.release_link_target(commit).display()
            ));
            (release, true)
        }
        Err(err) => match err.release_on_disk().cloned() {
            Some(release) => {
                let warning = Warning::CurrentLinkNotUpdated(err);
                reporter.warn(&warning.to_string());
                warnings.push(warning);
                (release, false)
            }
            None => return Err(AbortReason::Cutover(err)),
        },
    };
    drop(staging);

    // Past this point nothing may fail the run
    reporter.step("Purging old releases");
    purge_stale(ctx, &release, warnings);

    match &ctx.config.restart_command {
        Some(command) if live => {
            reporter.step("Restarting services");
            if let Err(err) = restart::notify(
                command,
                &release,
                project,
                ctx.paths.root(),
                ctx.runner,
                ctx.config.timeouts.restart(),
                reporter,
            ) {
                let warning = Warning::Restart(err);
                reporter.warn(&warning.to_string());
                warnings.push(warning);
            }
        }
        Some(_) => reporter.warn("Restart skipped because ln-release was not updated"),
        None => {}
    }

    Ok(release)
}

/// Create the build root skeleton on first deploy.
fn scaffold(paths: &BuildPaths) -> Result<(), AbortReason> {
    for dir in [
        paths.root().to_path_buf(),
        paths.permanent_dir(),
        paths.application_dir(),
        paths.staging_dir().to_path_buf(),
    ] {
        std::fs::create_dir_all(&dir).map_err(|source| AbortReason::Scaffold {
            path: dir.clone(),
            source,
        })?;
    }
    Ok(())
}

fn purge_stale(ctx: &PipelineContext<'_>, release: &Release, warnings: &mut Vec<Warning>) {
    let mut keep = HashSet::new();
    keep.insert(release.commit_id.to_string());
    // Protects the previous release when the link swap failed
    if let Some(live) = live_release(&ctx.paths) {
        keep.insert(live);
    }

    match release::purge(&ctx.paths.application_dir(), &keep) {
        Ok(stats) => {
            if stats.removed.is_empty() {
                ctx.reporter.detail("No old releases to purge");
            } else {
                ctx.reporter
                    .detail(&format!("Purged {} old release(s)", stats.removed.len()));
            }
            for (name, err) in stats.failed {
                let warning = Warning::Purge(format!("{name}: {err}"));
                ctx.reporter.warn(&warning.to_string());
                warnings.push(warning);
            }
        }
        Err(err) => {
            let warning = Warning::Purge(err.to_string());
            ctx.reporter.warn(&warning.to_string());
            warnings.push(warning);
        }
    }
}
