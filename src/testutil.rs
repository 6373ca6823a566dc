//! Shared test fixtures: bare git repositories and scripted process runners.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::Path;
use std::sync::Mutex;

use git2::{Oid, Repository, Signature};
use tempfile::TempDir;

use crate::process::{
    CommandSpec, OutputLine, ProcessError, ProcessOutput, ProcessRunner, Stream, SystemRunner,
};
use crate::types::CommitId;

fn git_available() -> bool {
    std::process::Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Whether tests needing the `git` binary can run.
pub fn require_git() -> bool {
    if git_available() {
        true
    } else {
        eprintln!("skipping test: git binary not available");
        false
    }
}

enum Node {
    Blob(Oid),
    Gitlink(Oid),
    Dir(BTreeMap<String, Node>),
}

/// A bare repository with a `master` branch built commit by commit.
pub struct FixtureRepo {
    _dir: TempDir,
    repo: Repository,
}

impl FixtureRepo {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let repo = Repository::init_bare(dir.path().join("repo.git")).expect("init bare repo");
        repo.set_head("refs/heads/master").expect("set HEAD");
        Self { _dir: dir, repo }
    }

    pub fn git_dir(&self) -> &Path {
        self.repo.path()
    }

    /// Commit a complete tree of `files` plus `gitlinks` onto `master`.
    pub fn commit(&self, files: &[(&str, &str)], gitlinks: &[(&str, &CommitId)]) -> CommitId {
        let mut root = BTreeMap::new();
        for (path, content) in files {
            let oid = self.repo.blob(content.as_bytes()).expect("write blob");
            insert(&mut root, path, Node::Blob(oid));
        }
        for (path, commit) in gitlinks {
            let oid = Oid::from_str(commit.as_str()).expect("gitlink oid");
            insert(&mut root, path, Node::Gitlink(oid));
        }

        let tree_id = write_tree(&self.repo, &root);
        let tree = self.repo.find_tree(tree_id).expect("find tree");
        let signature = Signature::now("Release Test", "release@example.com").expect("signature");

        let parent = self
            .repo
            .refname_to_id("refs/heads/master")
            .ok()
            .and_then(|id| self.repo.find_commit(id).ok());
        let parents: Vec<&git2::Commit> = parent.iter().collect();

        let oid = self
            .repo
            .commit(
                Some("refs/heads/master"),
                &signature,
                &signature,
                "fixture commit",
                &tree,
                &parents,
            )
            .expect("commit");
        oid.to_string().parse().expect("commit id")
    }
}

fn insert(dir: &mut BTreeMap<String, Node>, path: &str, leaf: Node) {
    match path.split_once('/') {
        None => {
            dir.insert(path.to_string(), leaf);
        }
        Some((head, rest)) => {
            let child = dir
                .entry(head.to_string())
                .or_insert_with(|| Node::Dir(BTreeMap::new()));
            match child {
                Node::Dir(children) => insert(children, rest, leaf),
                _ => panic!("fixture path {path} collides with a file"),
            }
        }
    }
}

fn write_tree(repo: &Repository, dir: &BTreeMap<String, Node>) -> Oid {
    let mut builder = repo.treebuilder(None).expect("treebuilder");
    for (name, node) in dir {
        let (oid, mode) = match node {
            Node::Blob(oid) => (*oid, 0o100644),
            Node::Gitlink(oid) => (*oid, 0o160000),
            Node::Dir(children) => (write_tree(repo, children), 0o040000),
        };
        builder.insert(name, oid, mode).expect("insert tree entry");
    }
    builder.write().expect("write tree")
}

type Script = Box<dyn Fn(&CommandSpec, &mut dyn FnMut(&OutputLine)) -> ProcessOutput>;

/// Runner that delegates `git` to the system and scripts every other program.
///
/// Programs without a script fail to spawn, like a missing binary would.
pub struct ScriptedRunner {
    system: SystemRunner,
    scripts: Vec<(String, Script)>,
    calls: Mutex<Vec<CommandSpec>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self {
            system: SystemRunner::new(),
            scripts: Vec::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn script(
        mut self,
        program: &str,
        script: impl Fn(&CommandSpec, &mut dyn FnMut(&OutputLine)) -> ProcessOutput + 'static,
    ) -> Self {
        self.scripts.push((program.to_string(), Box::new(script)));
        self
    }

    /// A dependency installer that writes `<cwd>/<output_dir>/autoload.php`.
    pub fn with_installer(self, program: &str, output_dir: &'static str) -> Self {
        self.script(program, move |command, sink| {
            let cwd = command.current_dir.clone().expect("installer needs a cwd");
            let out = cwd.join(output_dir);
            std::fs::create_dir_all(&out).expect("create output dir");
            std::fs::write(out.join("autoload.php"), "<?php // installed").expect("write");
            sink(&OutputLine {
                stream: Stream::Stdout,
                text: "Installing dependencies from lock file".to_string(),
            });
            exited(0)
        })
    }

    /// A program that always exits with `code`.
    pub fn with_exit(self, program: &str, code: i32) -> Self {
        self.script(program, move |_, sink| {
            sink(&OutputLine {
                stream: Stream::Stderr,
                text: format!("exiting with {code}"),
            });
            exited(code)
        })
    }

    /// Every recorded call to `program` (by file name).
    pub fn calls_to(&self, program: &str) -> Vec<CommandSpec> {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .filter(|c| c.program_name() == program)
            .cloned()
            .collect()
    }
}

pub fn exited(code: i32) -> ProcessOutput {
    ProcessOutput {
        code: Some(code),
        ..ProcessOutput::default()
    }
}

impl ProcessRunner for ScriptedRunner {
    fn run_streaming(
        &self,
        command: &CommandSpec,
        sink: &mut dyn FnMut(&OutputLine),
    ) -> Result<ProcessOutput, ProcessError> {
        self.calls.lock().expect("calls lock").push(command.clone());
        let program = command.program_name();
        if program == "git" {
            return self.system.run_streaming(command, sink);
        }
        match self.scripts.iter().find(|(name, _)| *name == program) {
            Some((_, script)) => Ok(script(command, sink)),
            None => Err(ProcessError::Spawn {
                program,
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "not scripted"),
            }),
        }
    }
}

/// Runner that behaves as if it ran inside a hook of `hook_git_dir`.
///
/// Every command inherits `GIT_DIR` and `GIT_OBJECT_DIRECTORY` pointing at
/// the hook repository unless it removes or overrides them.
pub struct HookEnvRunner {
    system: SystemRunner,
    inherited: Vec<(OsString, OsString)>,
}

impl HookEnvRunner {
    pub fn new(hook_git_dir: &Path) -> Self {
        Self {
            system: SystemRunner::new(),
            inherited: vec![
                ("GIT_DIR".into(), hook_git_dir.as_os_str().to_os_string()),
                (
                    "GIT_OBJECT_DIRECTORY".into(),
                    hook_git_dir.join("objects").into_os_string(),
                ),
            ],
        }
    }
}

impl ProcessRunner for HookEnvRunner {
    fn run_streaming(
        &self,
        command: &CommandSpec,
        sink: &mut dyn FnMut(&OutputLine),
    ) -> Result<ProcessOutput, ProcessError> {
        let mut command = command.clone();
        for (key, value) in &self.inherited {
            let removed = command.env_remove.contains(key);
            let overridden = command.env.iter().any(|(k, _)| k == key);
            if !removed && !overridden {
                command.env.insert(0, (key.clone(), value.clone()));
            }
        }
        self.system.run_streaming(&command, sink)
    }
}
