//! Progress reporting for the pushing user.
//!
//! Everything a receive hook writes ends up on the pusher's terminal prefixed
//! with `remote:`. The pipeline only talks to the [`Reporter`] trait; operator
//! diagnostics go through `log` instead.

use std::io::Write;
use std::sync::Mutex;

use crate::process::{OutputLine, Stream};

const CHECKMARK: &str = "\u{2713}";
const ARROW: &str = "------> ";
const INDENT: &str = "        ";

/// Sink for human-readable pipeline progress.
pub trait Reporter {
    /// A new top-level step begins.
    fn step(&self, message: &str);

    /// Supplementary information about the current step.
    fn detail(&self, message: &str);

    /// A non-fatal problem.
    fn warn(&self, message: &str);

    /// One line of streamed subprocess output.
    fn output(&self, line: &OutputLine);

    /// The run finished successfully.
    fn success(&self, message: &str);

    /// The run was aborted.
    fn abort(&self, message: &str);
}

/// Reporter writing the hook banner style to stdout.
#[derive(Debug, Default)]
pub struct ConsoleReporter;

impl ConsoleReporter {
    pub fn new() -> Self {
        Self
    }

    fn write_line(&self, line: &str) {
        let mut stdout = std::io::stdout().lock();
        // A closed pipe means the client went away; nothing useful to do about it
        let _ = writeln!(stdout, "{line}");
        let _ = stdout.flush();
    }
}

impl Reporter for ConsoleReporter {
    fn step(&self, message: &str) {
        self.write_line(&format!("{ARROW}{message}"));
    }

    fn detail(&self, message: &str) {
        self.write_line(&format!("{INDENT}{message}"));
    }

    fn warn(&self, message: &str) {
        self.write_line(&format!("{INDENT}Warning: {message}"));
    }

    fn output(&self, line: &OutputLine) {
        match line.stream {
            Stream::Stdout => self.write_line(&format!("{INDENT}| {}", line.text)),
            Stream::Stderr => self.write_line(&format!("{INDENT}! {}", line.text)),
        }
    }

    fn success(&self, message: &str) {
        let rule = "-".repeat(55);
        self.write_line("");
        self.write_line(&rule);
        self.write_line(&format!(" {CHECKMARK} {message}"));
        self.write_line(&rule);
        self.write_line("");
    }

    fn abort(&self, message: &str) {
        self.write_line("");
        self.write_line(&format!("{INDENT}{message}"));
        self.write_line(&format!("{INDENT}Push aborted"));
        self.write_line("");
    }
}

/// Kind of a recorded report line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    Step,
    Detail,
    Warn,
    Output,
    Success,
    Abort,
}

/// Reporter that keeps every line in memory.
#[derive(Debug, Default)]
pub struct RecordingReporter {
    lines: Mutex<Vec<(ReportKind, String)>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything reported so far.
    pub fn lines(&self) -> Vec<(ReportKind, String)> {
        match self.lines.lock() {
            Ok(lines) => lines.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Whether a line of `kind` containing `needle` was reported.
    pub fn contains(&self, kind: ReportKind, needle: &str) -> bool {
        self.lines()
            .iter()
            .any(|(k, text)| *k == kind && text.contains(needle))
    }

    fn push(&self, kind: ReportKind, text: &str) {
        let mut lines = match self.lines.lock() {
            Ok(lines) => lines,
            Err(poisoned) => poisoned.into_inner(),
        };
        lines.push((kind, text.to_string()));
    }
}

impl Reporter for RecordingReporter {
    fn step(&self, message: &str) {
        self.push(ReportKind::Step, message);
    }

    fn detail(&self, message: &str) {
        self.push(ReportKind::Detail, message);
    }

    fn warn(&self, message: &str) {
        self.push(ReportKind::Warn, message);
    }

    fn output(&self, line: &OutputLine) {
        self.push(ReportKind::Output, &line.text);
    }

    fn success(&self, message: &str) {
        self.push(ReportKind::Success, message);
    }

    fn abort(&self, message: &str) {
        self.push(ReportKind::Abort, message);
    }
}
