//! Git operations using a hybrid CLI + libgit2 approach.
//!
//! **CLI (with hardening) for anything that writes files:**
//! - `checkout_tree` / `checkout_paths` - materialize a commit from the bare
//!   repository into a staging tree with a private index
//! - `clone_no_checkout` / `checkout_detached` / `checkout_index` - submodule
//!   materialization
//!
//! **libgit2 for read operations:**
//! - `open_repository` - clean API for opening the bare repository
//! - `submodule_commit` - gitlink lookup in the pushed commit's tree
//!
//! Every CLI call goes through the [`ProcessRunner`] with a timeout, and its
//! output can be streamed to the caller.

use std::ffi::OsString;
use std::path::Path;
use std::time::Duration;

use git2::{ObjectType, Oid, Repository};
use thiserror::Error;

use crate::process::{CommandSpec, OutputLine, ProcessError, ProcessRunner};
use crate::types::CommitId;

/// File mode git records for a submodule (gitlink) entry
const GITLINK_MODE: i32 = 0o160000;

/// Repository selectors git exports to hooks. A hook in a bare repository
/// runs with `GIT_DIR=.`, and pre-receive adds the quarantine object store.
const HOOK_REPOSITORY_ENV: &[&str] = &[
    "GIT_DIR",
    "GIT_WORK_TREE",
    "GIT_INDEX_FILE",
    "GIT_OBJECT_DIRECTORY",
    "GIT_ALTERNATE_OBJECT_DIRECTORIES",
    "GIT_QUARANTINE_PATH",
];

/// Errors returned by git operations.
#[derive(Error, Debug)]
pub enum GitError {
    /// libgit2 reported an error.
    #[error("git operation failed: {0}")]
    Git(#[from] git2::Error),
    /// Repository path does not contain a git repo.
    #[error("repository not found at {0}")]
    NotFound(String),
    /// The git binary could not be run or timed out.
    #[error(transparent)]
    Process(#[from] ProcessError),
    /// Checkout failed.
    #[error("checkout failed: {0}")]
    CheckoutError(String),
    /// Clone failed.
    #[error("clone failed: {0}")]
    CloneError(String),
    /// Underlying IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Invalid inputs were provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Validate that a git ref (branch name or commit SHA) does not contain dangerous patterns.
///
/// Rejects:
/// - Empty strings
/// - Strings containing `..` (path traversal)
/// - Strings starting with `-` (could be interpreted as flags)
/// - Strings containing null bytes or control characters
fn validate_git_ref(value: &str, name: &str) -> Result<(), GitError> {
    if value.is_empty() {
        return Err(GitError::InvalidInput(format!("{} cannot be empty", name)));
    }
    if value.contains("..") {
        return Err(GitError::InvalidInput(format!(
            "{} cannot contain '..'",
            name
        )));
    }
    if value.starts_with('-') {
        return Err(GitError::InvalidInput(format!(
            "{} cannot start with '-'",
            name
        )));
    }
    if value.bytes().any(|b| b == 0 || b < 0x20) {
        return Err(GitError::InvalidInput(format!(
            "{} cannot contain null or control characters",
            name
        )));
    }
    Ok(())
}

/// Validate a remote URL taken from a declaration file.
///
/// `..` is legal in URLs (relative submodule remotes), so only flag injection
/// and control characters are rejected.
fn validate_url(value: &str) -> Result<(), GitError> {
    if value.is_empty() {
        return Err(GitError::InvalidInput("url cannot be empty".to_string()));
    }
    if value.starts_with('-') {
        return Err(GitError::InvalidInput(
            "url cannot start with '-'".to_string(),
        ));
    }
    if value.bytes().any(|b| b == 0 || b < 0x20) {
        return Err(GitError::InvalidInput(
            "url cannot contain null or control characters".to_string(),
        ));
    }
    Ok(())
}

/// Git CLI wrapper with security hardening.
///
/// Used for every operation that writes a working tree. Commands run through
/// the given [`ProcessRunner`] so output can be streamed and timed out.
pub struct GitCli<'a> {
    git_path: String,
    runner: &'a dyn ProcessRunner,
    timeout: Duration,
}

impl<'a> GitCli<'a> {
    /// Create a new GitCli instance using the system git.
    pub fn new(runner: &'a dyn ProcessRunner, timeout: Duration) -> Self {
        Self {
            git_path: "git".into(),
            runner,
            timeout,
        }
    }

    /// Create a hardened command with security settings.
    ///
    /// Applies:
    /// - `GIT_LFS_SKIP_SMUDGE=1` - skip LFS file downloads
    /// - `GIT_TERMINAL_PROMPT=0` - disable interactive prompts
    /// - `core.hooksPath=` - disable hooks execution
    fn command(&self) -> CommandSpec {
        CommandSpec::new(&self.git_path)
            .env("GIT_LFS_SKIP_SMUDGE", "1")
            .env("GIT_TERMINAL_PROMPT", "0")
            .args(["-c", "core.hooksPath="])
            .timeout(self.timeout)
    }

    /// Hardened command for a repository other than the hook's own.
    ///
    /// Drops the inherited repository selectors so `clone` and `-C` act on
    /// the paths they are given.
    fn isolated_command(&self) -> CommandSpec {
        HOOK_REPOSITORY_ENV
            .iter()
            .fold(self.command(), |command, key| command.env_remove(key))
    }

    /// Command operating on `git_dir` with `work_tree` and a private index file.
    ///
    /// The bare repository's own index is never read or written. The
    /// inherited object directories stay, so objects still in pre-receive
    /// quarantine are visible.
    fn work_tree_command(&self, git_dir: &Path, work_tree: &Path, index_file: &Path) -> CommandSpec {
        self.command()
            .env("GIT_INDEX_FILE", index_file)
            .arg("--git-dir")
            .arg(git_dir)
            .arg("--work-tree")
            .arg(work_tree)
    }

    /// Materialize the complete tree of `commit` into `work_tree`.
    pub fn checkout_tree(
        &self,
        git_dir: &Path,
        work_tree: &Path,
        index_file: &Path,
        commit: &CommitId,
        sink: &mut dyn FnMut(&OutputLine),
    ) -> Result<(), GitError> {
        validate_git_ref(commit.as_str(), "commit")?;
        std::fs::create_dir_all(work_tree)?;

        let command = self
            .work_tree_command(git_dir, work_tree, index_file)
            .args(["checkout", "-f"])
            .arg(commit.as_str())
            .args(["--", "."]);
        let output = self.runner.run_streaming(&command, sink)?;

        if !output.success() {
            return Err(GitError::CheckoutError(output.failure_summary()));
        }
        Ok(())
    }

    /// Materialize only `paths` of `commit` into `work_tree`.
    ///
    /// Fails if any path does not exist in the commit.
    pub fn checkout_paths(
        &self,
        git_dir: &Path,
        work_tree: &Path,
        index_file: &Path,
        commit: &CommitId,
        paths: &[&str],
    ) -> Result<(), GitError> {
        validate_git_ref(commit.as_str(), "commit")?;
        for path in paths {
            validate_git_ref(path, "path")?;
        }
        std::fs::create_dir_all(work_tree)?;

        let command = self
            .work_tree_command(git_dir, work_tree, index_file)
            .args(["checkout", "-f"])
            .arg(commit.as_str())
            .arg("--")
            .args(paths);
        let output = self.runner.run(&command)?;

        if !output.success() {
            return Err(GitError::CheckoutError(output.failure_summary()));
        }
        Ok(())
    }

    /// Clone `url` into `dest` without checking anything out.
    ///
    /// On failure a freshly created `dest` is removed again.
    pub fn clone_no_checkout(
        &self,
        url: &str,
        dest: &Path,
        sink: &mut dyn FnMut(&OutputLine),
    ) -> Result<(), GitError> {
        validate_url(url)?;

        let dest_existed = dest.exists();
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let command = self
            .isolated_command()
            .args(["clone", "--no-checkout", "--progress", "--"])
            .arg(url)
            .arg(dest);
        let output = self.runner.run_streaming(&command, sink)?;

        if !output.success() {
            if !dest_existed {
                let _ = std::fs::remove_dir_all(dest);
            }
            return Err(GitError::CloneError(output.failure_summary()));
        }
        Ok(())
    }

    /// Check out `commit` in `repo` on a detached HEAD.
    pub fn checkout_detached(
        &self,
        repo: &Path,
        commit: &CommitId,
        sink: &mut dyn FnMut(&OutputLine),
    ) -> Result<(), GitError> {
        validate_git_ref(commit.as_str(), "commit")?;

        let command = self
            .isolated_command()
            .arg("-C")
            .arg(repo)
            .args(["checkout", "--detach"])
            .arg(commit.as_str());
        let output = self.runner.run_streaming(&command, sink)?;

        if !output.success() {
            return Err(GitError::CheckoutError(output.failure_summary()));
        }
        Ok(())
    }

    /// Copy every tracked file of `repo`'s index into `dest`, without `.git`.
    pub fn checkout_index(&self, repo: &Path, dest: &Path) -> Result<(), GitError> {
        std::fs::create_dir_all(dest)?;

        // --prefix is a plain string prefix; the trailing slash makes it a directory
        let mut prefix = OsString::from("--prefix=");
        prefix.push(dest.as_os_str());
        prefix.push("/");

        let command = self
            .isolated_command()
            .arg("-C")
            .arg(repo)
            .args(["checkout-index", "-a", "-f"])
            .arg(prefix);
        let output = self.runner.run(&command)?;

        if !output.success() {
            return Err(GitError::CheckoutError(output.failure_summary()));
        }
        Ok(())
    }
}

/// Open an existing repository at the given path.
pub fn open_repository(path: &Path) -> Result<Repository, GitError> {
    let repo = Repository::open(path).map_err(|e| {
        if e.code() == git2::ErrorCode::NotFound {
            GitError::NotFound(path.display().to_string())
        } else {
            GitError::Git(e)
        }
    })?;
    Ok(repo)
}

/// Check if a path contains a valid git repository.
pub fn repository_exists(path: &Path) -> bool {
    Repository::open(path).is_ok()
}

/// Commit id recorded for the submodule at `path` in `commit`'s tree.
///
/// Returns `None` when the path is absent or is not a gitlink entry.
pub fn submodule_commit(
    repo: &Repository,
    commit: &CommitId,
    path: &Path,
) -> Result<Option<CommitId>, GitError> {
    let oid = Oid::from_str(commit.as_str())?;
    let object = repo.find_object(oid, None)?;
    let commit = object.peel_to_commit()?;
    let tree = commit.tree()?;

    let entry = match tree.get_path(path) {
        Ok(entry) => entry,
        Err(e) if e.code() == git2::ErrorCode::NotFound => return Ok(None),
        Err(e) => return Err(GitError::Git(e)),
    };

    if entry.filemode() != GITLINK_MODE || entry.kind() != Some(ObjectType::Commit) {
        return Ok(None);
    }

    let pinned = entry.id().to_string();
    pinned
        .parse()
        .map(Some)
        .map_err(|e| GitError::InvalidInput(format!("gitlink id '{pinned}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::SystemRunner;
    use crate::testutil::{FixtureRepo, HookEnvRunner, require_git};
    use tempfile::tempdir;

    fn git(runner: &SystemRunner) -> GitCli<'_> {
        GitCli::new(runner, Duration::from_secs(60))
    }

    #[test]
    fn validate_git_ref_rejects_flags_and_traversal() {
        assert!(validate_git_ref("abc123", "commit").is_ok());
        assert!(validate_git_ref("", "commit").is_err());
        assert!(validate_git_ref("--upload-pack=x", "commit").is_err());
        assert!(validate_git_ref("a..b", "commit").is_err());
        assert!(validate_git_ref("a\nb", "commit").is_err());
    }

    #[test]
    fn validate_url_allows_relative_remotes() {
        assert!(validate_url("../lib.git").is_ok());
        assert!(validate_url("https://example.com/lib.git").is_ok());
        assert!(validate_url("-oProxyCommand=x").is_err());
        assert!(validate_url("").is_err());
    }

    #[test]
    fn repository_exists_returns_false_for_regular_directory() {
        let temp_dir = tempdir().expect("Failed to create temp directory");
        assert!(!repository_exists(temp_dir.path()));
    }

    #[test]
    fn open_repository_not_found() {
        let temp_dir = tempdir().expect("Failed to create temp directory");
        let nonexistent = temp_dir.path().join("nonexistent");

        match open_repository(&nonexistent) {
            Err(GitError::NotFound(path)) => assert!(path.contains("nonexistent")),
            other => panic!("Expected NotFound error, got: {:?}", other.err()),
        }
    }

    #[test]
    fn submodule_commit_reads_gitlink() {
        let fixture = FixtureRepo::new();
        let pinned: CommitId = "1111111111111111111111111111111111111111".parse().unwrap();
        let commit = fixture.commit(&[("README", "hi")], &[("lib/dep", &pinned)]);
        let repo = open_repository(fixture.git_dir()).unwrap();

        let found = submodule_commit(&repo, &commit, Path::new("lib/dep")).unwrap();
        assert_eq!(found, Some(pinned));
    }

    #[test]
    fn submodule_commit_ignores_regular_files_and_missing_paths() {
        let fixture = FixtureRepo::new();
        let commit = fixture.commit(&[("lib/dep", "not a submodule")], &[]);
        let repo = open_repository(fixture.git_dir()).unwrap();

        assert_eq!(
            submodule_commit(&repo, &commit, Path::new("lib/dep")).unwrap(),
            None
        );
        assert_eq!(
            submodule_commit(&repo, &commit, Path::new("missing")).unwrap(),
            None
        );
    }

    #[test]
    fn checkout_tree_materializes_commit_without_touching_repo_index() {
        if !require_git() {
            return;
        }
        let fixture = FixtureRepo::new();
        let commit = fixture.commit(&[("index.php", "<?php"), ("src/app.php", "app")], &[]);
        let scratch = tempdir().unwrap();
        let tree = scratch.path().join("tree");
        let index = scratch.path().join("index");

        let runner = SystemRunner::new();
        git(&runner)
            .checkout_tree(fixture.git_dir(), &tree, &index, &commit, &mut |_| {})
            .unwrap();

        assert_eq!(std::fs::read_to_string(tree.join("index.php")).unwrap(), "<?php");
        assert_eq!(std::fs::read_to_string(tree.join("src/app.php")).unwrap(), "app");
        assert!(!tree.join(".git").exists());
        assert!(index.exists());
        assert!(!fixture.git_dir().join("index").exists());
    }

    #[test]
    fn checkout_paths_fails_for_missing_file() {
        if !require_git() {
            return;
        }
        let fixture = FixtureRepo::new();
        let commit = fixture.commit(&[("README", "hi")], &[]);
        let scratch = tempdir().unwrap();

        let runner = SystemRunner::new();
        let result = git(&runner).checkout_paths(
            fixture.git_dir(),
            scratch.path(),
            &scratch.path().join("index"),
            &commit,
            &["buildfile.json"],
        );
        assert!(matches!(result, Err(GitError::CheckoutError(_))));
    }

    #[test]
    fn clone_and_export_pinned_commit() {
        if !require_git() {
            return;
        }
        let upstream = FixtureRepo::new();
        let first = upstream.commit(&[("lib.php", "v1")], &[]);
        upstream.commit(&[("lib.php", "v2")], &[]);

        let scratch = tempdir().unwrap();
        let clone = scratch.path().join("clone");
        let export = scratch.path().join("export");
        let url = upstream.git_dir().to_string_lossy().into_owned();

        let runner = SystemRunner::new();
        let cli = git(&runner);
        cli.clone_no_checkout(&url, &clone, &mut |_| {}).unwrap();
        cli.checkout_detached(&clone, &first, &mut |_| {}).unwrap();
        cli.checkout_index(&clone, &export).unwrap();

        assert_eq!(std::fs::read_to_string(export.join("lib.php")).unwrap(), "v1");
        assert!(!export.join(".git").exists());
    }

    #[test]
    fn submodule_commands_ignore_hook_repository_env() {
        if !require_git() {
            return;
        }
        let hook = FixtureRepo::new();
        let hook_head = hook.commit(&[("README", "parent")], &[]);
        let upstream = FixtureRepo::new();
        let first = upstream.commit(&[("lib.php", "v1")], &[]);
        upstream.commit(&[("lib.php", "v2")], &[]);

        let scratch = tempdir().unwrap();
        let clone = scratch.path().join("clone");
        let export = scratch.path().join("export");
        let url = upstream.git_dir().to_string_lossy().into_owned();

        let runner = HookEnvRunner::new(hook.git_dir());
        let cli = GitCli::new(&runner, Duration::from_secs(60));
        cli.clone_no_checkout(&url, &clone, &mut |_| {}).unwrap();
        cli.checkout_detached(&clone, &first, &mut |_| {}).unwrap();
        cli.checkout_index(&clone, &export).unwrap();

        assert_eq!(std::fs::read_to_string(export.join("lib.php")).unwrap(), "v1");
        assert!(clone.join(".git").is_dir());

        let tree = scratch.path().join("tree");
        cli.checkout_tree(
            hook.git_dir(),
            &tree,
            &scratch.path().join("index"),
            &hook_head,
            &mut |_| {},
        )
        .unwrap();
        assert_eq!(std::fs::read_to_string(tree.join("README")).unwrap(), "parent");
    }

    #[test]
    fn clone_failure_removes_destination() {
        if !require_git() {
            return;
        }
        let scratch = tempdir().unwrap();
        let dest = scratch.path().join("clone");
        let missing = scratch.path().join("no-such-repo.git");

        let runner = SystemRunner::new();
        let result =
            git(&runner).clone_no_checkout(&missing.to_string_lossy(), &dest, &mut |_| {});
        assert!(matches!(result, Err(GitError::CloneError(_))));
        assert!(!dest.exists());
    }
}
