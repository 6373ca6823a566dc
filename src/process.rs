//! External process execution.
//!
//! Every external tool the pipeline touches (git, the dependency installer,
//! the restart script) runs through [`ProcessRunner`]. Output is read line by
//! line on helper threads and handed to the caller as it arrives, so long
//! clones and installs show progress on the pusher's terminal instead of
//! dumping everything at exit. Every command carries an optional timeout;
//! expiry kills the child.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, Sender, unbounded};
use thiserror::Error;

/// How often a running child is checked for exit while waiting on output
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long output is still collected after the child itself exited
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Errors returned while running an external command.
#[derive(Error, Debug)]
pub enum ProcessError {
    /// The program could not be started at all.
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    /// The program did not finish before its deadline and was killed.
    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },
    /// Waiting on the child failed.
    #[error("failed to wait for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// Which standard stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// One line of subprocess output, without its line terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: Stream,
    pub text: String,
}

/// Description of a command to run. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub current_dir: Option<PathBuf>,
    pub env: Vec<(OsString, OsString)>,
    /// Inherited variables removed before `env` is applied
    pub env_remove: Vec<OsString>,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            current_dir: None,
            env: Vec::new(),
            env_remove: Vec::new(),
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.env
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    pub fn env_remove(mut self, key: impl AsRef<OsStr>) -> Self {
        self.env_remove.push(key.as_ref().to_os_string());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Program name used in messages
    pub fn program_name(&self) -> String {
        Path::new(&self.program)
            .file_name()
            .unwrap_or(self.program.as_os_str())
            .to_string_lossy()
            .into_owned()
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Collected result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code; `None` when the child was terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Short human-readable reason for a failed command.
    pub fn failure_summary(&self) -> String {
        let code = match self.code {
            Some(code) => format!("exit code {code}"),
            None => "terminated by signal".to_string(),
        };
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            code
        } else {
            let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
            let tail: Vec<&str> = tail.into_iter().rev().collect();
            format!("{code}: {}", tail.join(" / "))
        }
    }
}

/// Execution boundary for external programs.
pub trait ProcessRunner {
    /// Run a command, forwarding each output line to `sink` as it arrives.
    fn run_streaming(
        &self,
        command: &CommandSpec,
        sink: &mut dyn FnMut(&OutputLine),
    ) -> Result<ProcessOutput, ProcessError>;

    /// Run a command and only collect its output.
    fn run(&self, command: &CommandSpec) -> Result<ProcessOutput, ProcessError> {
        self.run_streaming(command, &mut |_| {})
    }
}

/// Runs commands on the host with `std::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessRunner for SystemRunner {
    fn run_streaming(
        &self,
        spec: &CommandSpec,
        sink: &mut dyn FnMut(&OutputLine),
    ) -> Result<ProcessOutput, ProcessError> {
        let program = spec.program_name();
        log::debug!("running: {}", spec);

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &spec.current_dir {
            command.current_dir(dir);
        }
        for key in &spec.env_remove {
            command.env_remove(key);
        }
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            program: program.clone(),
            source,
        })?;

        let (tx, rx) = unbounded::<OutputLine>();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, Stream::Stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, Stream::Stderr, tx.clone()));
        }
        // Channel disconnects once both readers hit EOF
        drop(tx);

        let deadline = spec.timeout.map(|t| Instant::now() + t);
        let mut output = ProcessOutput::default();
        let mut exited: Option<ExitStatus> = None;
        let mut drain_until: Option<Instant> = None;
        let mut disconnected = false;

        loop {
            let now = Instant::now();
            let mut wait = EXIT_POLL_INTERVAL;
            if exited.is_none() {
                if let Some(deadline) = deadline {
                    if now >= deadline {
                        kill_child(&mut child);
                        return Err(ProcessError::Timeout {
                            program,
                            timeout: spec.timeout.unwrap_or_default(),
                        });
                    }
                    wait = wait.min(deadline - now);
                }
            }
            if let Some(until) = drain_until {
                // A background grandchild may keep the pipes open forever
                if now >= until {
                    break;
                }
                wait = wait.min(until - now);
            }

            match rx.recv_timeout(wait) {
                Ok(line) => {
                    let buffer = match line.stream {
                        Stream::Stdout => &mut output.stdout,
                        Stream::Stderr => &mut output.stderr,
                    };
                    buffer.push_str(&line.text);
                    buffer.push('\n');
                    sink(&line);
                }
                Err(RecvTimeoutError::Disconnected) => {
                    disconnected = true;
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {}
            }

            if exited.is_none() {
                let status = child.try_wait().map_err(|source| ProcessError::Wait {
                    program: program.clone(),
                    source,
                })?;
                if let Some(status) = status {
                    exited = Some(status);
                    drain_until = Some(Instant::now() + EXIT_DRAIN_GRACE);
                }
            }
        }

        let status = match exited {
            Some(status) => status,
            None => {
                let status = wait_with_deadline(&mut child, deadline).map_err(|source| {
                    ProcessError::Wait {
                        program: program.clone(),
                        source,
                    }
                })?;
                match status {
                    Some(status) => status,
                    None => {
                        return Err(ProcessError::Timeout {
                            program,
                            timeout: spec.timeout.unwrap_or_default(),
                        });
                    }
                }
            }
        };

        if disconnected {
            for reader in readers {
                let _ = reader.join();
            }
        } else {
            log::debug!("{} exited with its output still open; not waiting for it", program);
        }

        output.code = status.code();
        log::debug!("{} finished with {:?}", program, output.code);
        Ok(output)
    }
}

fn spawn_reader<R>(pipe: R, stream: Stream, tx: Sender<OutputLine>) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    // Progress meters rewrite a line with '\r'; report each update
                    for piece in buf.split(|b| *b == b'\n' || *b == b'\r') {
                        if piece.is_empty() {
                            continue;
                        }
                        let line = OutputLine {
                            stream,
                            text: String::from_utf8_lossy(piece).into_owned(),
                        };
                        if tx.send(line).is_err() {
                            return;
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    })
}

/// Wait for exit. Returns `Ok(None)` if the deadline passed (child is killed).
fn wait_with_deadline(
    child: &mut Child,
    deadline: Option<Instant>,
) -> io::Result<Option<ExitStatus>> {
    let Some(deadline) = deadline else {
        return child.wait().map(Some);
    };

    let mut sleep_duration = Duration::from_millis(5);
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            kill_child(child);
            return Ok(None);
        }
        thread::sleep(sleep_duration);
        sleep_duration = (sleep_duration * 2).min(Duration::from_millis(100));
    }
}

fn kill_child(child: &mut Child) {
    if let Err(e) = child.kill() {
        log::warn!("failed to kill child process {}: {}", child.id(), e);
    }
    let _ = child.wait();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").arg("-c").arg(script)
    }

    #[test]
    fn run_collects_stdout() {
        let output = SystemRunner.run(&CommandSpec::new("echo").arg("hello")).unwrap();
        assert!(output.success());
        assert_eq!(output.code, Some(0));
        assert_eq!(output.stdout, "hello\n");
    }

    #[test]
    fn run_reports_failure_code() {
        let output = SystemRunner.run(&sh("echo broken >&2; exit 3")).unwrap();
        assert!(!output.success());
        assert_eq!(output.code, Some(3));
        assert_eq!(output.stderr, "broken\n");
        assert_eq!(output.failure_summary(), "exit code 3: broken");
    }

    #[test]
    fn streaming_forwards_lines_in_order() {
        let mut seen = Vec::new();
        let output = SystemRunner
            .run_streaming(&sh("echo one; echo two; echo three"), &mut |line| {
                seen.push(line.clone())
            })
            .unwrap();
        assert!(output.success());
        let texts: Vec<&str> = seen.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(texts, vec!["one", "two", "three"]);
        assert!(seen.iter().all(|l| l.stream == Stream::Stdout));
    }

    #[test]
    fn streaming_tags_stderr() {
        let mut seen = Vec::new();
        SystemRunner
            .run_streaming(&sh("echo oops >&2"), &mut |line| seen.push(line.clone()))
            .unwrap();
        assert_eq!(
            seen,
            vec![OutputLine {
                stream: Stream::Stderr,
                text: "oops".into()
            }]
        );
    }

    #[test]
    fn streaming_splits_carriage_returns() {
        let mut seen = Vec::new();
        SystemRunner
            .run_streaming(&sh("printf '10%%\\r50%%\\r100%%\\n'"), &mut |line| {
                seen.push(line.text.clone())
            })
            .unwrap();
        assert_eq!(seen, vec!["10%", "50%", "100%"]);
    }

    #[test]
    fn timeout_kills_child() {
        let start = Instant::now();
        let result = SystemRunner.run(&sh("sleep 5").timeout(Duration::from_millis(200)));
        assert!(matches!(result, Err(ProcessError::Timeout { .. })));
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn exited_child_does_not_wait_for_background_output() {
        // The backgrounded sleep inherits stdout and keeps the pipe open
        let start = Instant::now();
        let output = SystemRunner
            .run(&sh("sleep 3 & echo restarted; exit 0").timeout(Duration::from_secs(2)))
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout, "restarted\n");
        assert!(start.elapsed() < Duration::from_millis(1500));
    }

    #[test]
    fn env_remove_hides_inherited_variable() {
        let output = SystemRunner
            .run(&sh("echo \"[${HOME:-unset}]\"").env_remove("HOME"))
            .unwrap();
        assert_eq!(output.stdout, "[unset]\n");
    }

    #[test]
    fn spawn_error_for_missing_program() {
        let result = SystemRunner.run(&CommandSpec::new("definitely-not-a-real-program-xyz"));
        match result {
            Err(ProcessError::Spawn { program, .. }) => {
                assert_eq!(program, "definitely-not-a-real-program-xyz")
            }
            other => panic!("Expected Spawn error, got: {:?}", other),
        }
    }

    #[test]
    fn current_dir_and_env_are_applied() {
        let dir = tempdir().unwrap();
        let output = SystemRunner
            .run(
                &sh("pwd; echo $RELEASEHOOK_TEST")
                    .current_dir(dir.path())
                    .env("RELEASEHOOK_TEST", "value"),
            )
            .unwrap();
        let lines: Vec<&str> = output.stdout.lines().collect();
        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(Path::new(lines[0]).canonicalize().unwrap(), expected);
        assert_eq!(lines[1], "value");
    }

    #[test]
    fn command_spec_display() {
        let spec = CommandSpec::new("/usr/bin/git").args(["checkout", "-f"]);
        assert_eq!(spec.to_string(), "/usr/bin/git checkout -f");
        assert_eq!(spec.program_name(), "git");
    }

    #[test]
    fn failure_summary_signal() {
        let output = ProcessOutput {
            code: None,
            ..ProcessOutput::default()
        };
        assert_eq!(output.failure_summary(), "terminated by signal");
    }
}
