//! External restart notification after a successful cutover.

use std::path::Path;
use std::time::Duration;

use thiserror::Error;

use crate::process::{CommandSpec, ProcessError, ProcessRunner};
use crate::release::Release;
use crate::report::Reporter;

#[derive(Error, Debug)]
pub enum RestartError {
    #[error("restart command is empty")]
    EmptyCommand,
    #[error("restart command could not run: {0}")]
    Process(#[from] ProcessError),
    #[error("restart command failed ({0})")]
    Failed(String),
}

/// Run the configured restart command for a freshly promoted release.
///
/// Runs in `build_root` with the release described through the environment;
/// output is streamed to the reporter.
pub fn notify(
    command: &[String],
    release: &Release,
    project: &str,
    build_root: &Path,
    runner: &dyn ProcessRunner,
    timeout: Duration,
    reporter: &dyn Reporter,
) -> Result<(), RestartError> {
    let (program, args) = command.split_first().ok_or(RestartError::EmptyCommand)?;
    let spec = CommandSpec::new(program)
        .args(args)
        .current_dir(build_root)
        .env("RELEASEHOOK_COMMIT", release.commit_id.as_str())
        .env("RELEASEHOOK_RELEASE_DIR", &release.path)
        .env("RELEASEHOOK_PROJECT", project)
        .timeout(timeout);

    let output = runner.run_streaming(&spec, &mut |line| reporter.output(line))?;
    if !output.success() {
        return Err(RestartError::Failed(output.failure_summary()));
    }
    Ok(())
}
