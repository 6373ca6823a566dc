//! Submodule resolution.
//!
//! Declared submodules are pinned to the commit the parent tree records for
//! their path (the gitlink entry), never to the tip of the submodule's branch.
//! Each one is cloned into a private temporary directory, checked out at the
//! pinned commit and exported into the staging tree without `.git` metadata.

pub mod gitmodules;

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::git::{GitCli, GitError, open_repository, submodule_commit};
use crate::paths::{UnsafePathError, validate_relative_path};
use crate::process::OutputLine;
use crate::report::Reporter;
use crate::types::CommitId;

pub use gitmodules::{GitmodulesError, SubmoduleDecl};

/// Name of the declaration file at the project root
pub const DECLARATION_FILE: &str = ".gitmodules";

/// Errors returned while resolving submodules. Every variant aborts the run.
#[derive(Error, Debug)]
pub enum SubmoduleError {
    #[error("invalid .gitmodules: {0}")]
    Declaration(#[from] GitmodulesError),
    #[error("submodule '{name}': {source}")]
    UnsafePath {
        name: String,
        #[source]
        source: UnsafePathError,
    },
    #[error("submodule '{name}': the pushed commit records no gitlink at '{path}'")]
    NotPinned { name: String, path: String },
    #[error("failed to inspect the parent repository: {0}")]
    Repository(#[source] GitError),
    #[error("submodule '{name}': {source}")]
    Git {
        name: String,
        #[source]
        source: GitError,
    },
    #[error("failed to prepare {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A declared submodule pinned to the commit its parent recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmoduleSpec {
    pub name: String,
    pub relative_path: PathBuf,
    pub remote_url: String,
    pub pinned_commit: CommitId,
    /// Informational only; content selection uses `pinned_commit`
    pub branch: String,
}

/// Read the declarations in `staging_tree` and pin each one via the parent tree.
///
/// Returns an empty list when the tree has no declaration file.
pub fn discover(
    git_dir: &Path,
    commit: &CommitId,
    staging_tree: &Path,
) -> Result<Vec<SubmoduleSpec>, SubmoduleError> {
    let declaration = staging_tree.join(DECLARATION_FILE);
    if !declaration.exists() {
        return Ok(Vec::new());
    }

    let decls = gitmodules::read(&declaration)?;
    if decls.is_empty() {
        return Ok(Vec::new());
    }

    let repo = open_repository(git_dir).map_err(SubmoduleError::Repository)?;
    decls
        .into_iter()
        .map(|decl| {
            let relative_path =
                validate_relative_path(&decl.path).map_err(|source| SubmoduleError::UnsafePath {
                    name: decl.name.clone(),
                    source,
                })?;
            if relative_path.as_os_str().is_empty() {
                return Err(SubmoduleError::UnsafePath {
                    name: decl.name,
                    source: UnsafePathError::Empty,
                });
            }

            let pinned_commit = submodule_commit(&repo, commit, &relative_path)
                .map_err(SubmoduleError::Repository)?
                .ok_or_else(|| SubmoduleError::NotPinned {
                    name: decl.name.clone(),
                    path: decl.path.clone(),
                })?;

            Ok(SubmoduleSpec {
                remote_url: resolve_remote_url(&decl.url, git_dir),
                name: decl.name,
                relative_path,
                pinned_commit,
                branch: decl.branch,
            })
        })
        .collect()
}

/// Materialize every declared submodule of `commit` into `staging_tree`.
///
/// All submodules are pinned before the first clone starts, so a bad
/// declaration fails fast. Temporary clones are removed on every path.
pub fn resolve(
    git: &GitCli<'_>,
    git_dir: &Path,
    commit: &CommitId,
    staging_tree: &Path,
    reporter: &dyn Reporter,
) -> Result<Vec<SubmoduleSpec>, SubmoduleError> {
    let specs = discover(git_dir, commit, staging_tree)?;
    if specs.is_empty() {
        reporter.detail("No submodules declared");
        return Ok(specs);
    }

    for spec in &specs {
        reporter.detail(&format!(
            "{} -> {} @ {}",
            spec.relative_path.display(),
            spec.remote_url,
            spec.pinned_commit.short()
        ));
        materialize(git, spec, staging_tree, reporter)?;
    }
    Ok(specs)
}

fn materialize(
    git: &GitCli<'_>,
    spec: &SubmoduleSpec,
    staging_tree: &Path,
    reporter: &dyn Reporter,
) -> Result<(), SubmoduleError> {
    let git_error = |source: GitError| SubmoduleError::Git {
        name: spec.name.clone(),
        source,
    };
    let mut forward = |line: &OutputLine| reporter.output(line);

    let scratch = tempfile::Builder::new()
        .prefix("releasehook-submodule-")
        .tempdir()
        .map_err(|source| SubmoduleError::Io {
            path: std::env::temp_dir(),
            source,
        })?;
    let clone_dir = scratch.path().join("clone");

    git.clone_no_checkout(&spec.remote_url, &clone_dir, &mut forward)
        .map_err(git_error)?;
    git.checkout_detached(&clone_dir, &spec.pinned_commit, &mut forward)
        .map_err(git_error)?;

    let target = staging_tree.join(&spec.relative_path);
    clear_target(&target)?;
    git.checkout_index(&clone_dir, &target).map_err(git_error)?;

    log::info!(
        "materialized submodule {} at {}",
        spec.name,
        spec.pinned_commit
    );
    // `scratch` drops here and removes the clone
    Ok(())
}

/// The parent checkout leaves an empty directory (or nothing) at a gitlink path.
fn clear_target(target: &Path) -> Result<(), SubmoduleError> {
    let io_error = |source: io::Error| SubmoduleError::Io {
        path: target.to_path_buf(),
        source,
    };
    match std::fs::symlink_metadata(target) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(target).map_err(io_error)?,
        Ok(_) => std::fs::remove_file(target).map_err(io_error)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(io_error(e)),
    }
    std::fs::create_dir_all(target).map_err(io_error)
}

/// Resolve `./x` and `../x` remotes against the parent repository.
///
/// Mirrors git's rule: the parent repository itself is the base, so `../x`
/// names a sibling of the parent's git directory.
pub fn resolve_remote_url(url: &str, git_dir: &Path) -> String {
    if !(url.starts_with("./") || url.starts_with("../")) {
        return url.to_string();
    }

    let mut base = git_dir.to_path_buf();
    let mut rest = url;
    loop {
        if let Some(stripped) = rest.strip_prefix("./") {
            rest = stripped;
        } else if let Some(stripped) = rest.strip_prefix("../") {
            base.pop();
            rest = stripped;
        } else {
            break;
        }
    }
    base.join(rest).to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::SystemRunner;
    use crate::report::{RecordingReporter, ReportKind};
    use crate::testutil::{FixtureRepo, require_git};
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn relative_urls_resolve_against_git_dir() {
        let git_dir = Path::new("/srv/git/app.git");
        assert_eq!(resolve_remote_url("../lib.git", git_dir), "/srv/git/lib.git");
        assert_eq!(
            resolve_remote_url("./nested.git", git_dir),
            "/srv/git/app.git/nested.git"
        );
        assert_eq!(
            resolve_remote_url("../../shared/lib.git", git_dir),
            "/srv/shared/lib.git"
        );
        assert_eq!(
            resolve_remote_url("git@example.com:acme/lib.git", git_dir),
            "git@example.com:acme/lib.git"
        );
    }

    #[test]
    fn no_declaration_file_is_a_noop() {
        let fixture = FixtureRepo::new();
        let commit = fixture.commit(&[("README", "hi")], &[]);
        let tree = tempdir().unwrap();

        let specs = discover(fixture.git_dir(), &commit, tree.path()).unwrap();
        assert!(specs.is_empty());
    }

    #[test]
    fn discover_pins_to_parent_gitlink() {
        let fixture = FixtureRepo::new();
        let pinned: CommitId = "2222222222222222222222222222222222222222".parse().unwrap();
        let gitmodules = "[submodule \"lib\"]\n\tpath = vendor/lib\n\turl = ../lib.git\n\tbranch = develop\n";
        let commit = fixture.commit(&[(".gitmodules", gitmodules)], &[("vendor/lib", &pinned)]);
        let tree = tempdir().unwrap();
        std::fs::write(tree.path().join(".gitmodules"), gitmodules).unwrap();

        let specs = discover(fixture.git_dir(), &commit, tree.path()).unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].relative_path, PathBuf::from("vendor/lib"));
        assert_eq!(specs[0].pinned_commit, pinned);
        assert_eq!(specs[0].branch, "develop");
        assert!(specs[0].remote_url.ends_with("lib.git"));
        assert!(Path::new(&specs[0].remote_url).is_absolute());
    }

    #[test]
    fn declared_path_without_gitlink_fails() {
        let fixture = FixtureRepo::new();
        let gitmodules = "[submodule \"lib\"]\n\tpath = lib\n\turl = ../lib.git\n";
        let commit = fixture.commit(&[(".gitmodules", gitmodules)], &[]);
        let tree = tempdir().unwrap();
        std::fs::write(tree.path().join(".gitmodules"), gitmodules).unwrap();

        let result = discover(fixture.git_dir(), &commit, tree.path());
        assert!(matches!(result, Err(SubmoduleError::NotPinned { .. })));
    }

    #[test]
    fn traversal_paths_are_rejected() {
        let fixture = FixtureRepo::new();
        let commit = fixture.commit(&[("README", "hi")], &[]);
        let tree = tempdir().unwrap();
        std::fs::write(
            tree.path().join(".gitmodules"),
            "[submodule \"evil\"]\n\tpath = ../../etc\n\turl = ../x.git\n",
        )
        .unwrap();

        let result = discover(fixture.git_dir(), &commit, tree.path());
        assert!(matches!(result, Err(SubmoduleError::UnsafePath { .. })));
    }

    #[test]
    fn resolve_materializes_pinned_commit_not_branch_tip() {
        if !require_git() {
            return;
        }
        let upstream = FixtureRepo::new();
        let pinned = upstream.commit(&[("lib.php", "pinned")], &[]);
        upstream.commit(&[("lib.php", "newer tip")], &[]);

        let parent = FixtureRepo::new();
        let url = upstream.git_dir().to_string_lossy().into_owned();
        let gitmodules = format!("[submodule \"lib\"]\n\tpath = lib\n\turl = {url}\n");
        let commit = parent.commit(&[(".gitmodules", gitmodules.as_str())], &[("lib", &pinned)]);

        let tree = tempdir().unwrap();
        std::fs::write(tree.path().join(".gitmodules"), &gitmodules).unwrap();
        std::fs::create_dir(tree.path().join("lib")).unwrap();

        let runner = SystemRunner::new();
        let git = GitCli::new(&runner, Duration::from_secs(60));
        let reporter = RecordingReporter::new();
        let specs = resolve(&git, parent.git_dir(), &commit, tree.path(), &reporter).unwrap();

        assert_eq!(specs.len(), 1);
        assert_eq!(
            std::fs::read_to_string(tree.path().join("lib/lib.php")).unwrap(),
            "pinned"
        );
        assert!(!tree.path().join("lib/.git").exists());
        assert!(reporter.contains(ReportKind::Detail, "lib ->"));
    }

    #[test]
    fn clone_failure_aborts() {
        if !require_git() {
            return;
        }
        let parent = FixtureRepo::new();
        let pinned: CommitId = "3333333333333333333333333333333333333333".parse().unwrap();
        let gitmodules = "[submodule \"gone\"]\n\tpath = gone\n\turl = ../does-not-exist.git\n";
        let commit = parent.commit(&[(".gitmodules", gitmodules)], &[("gone", &pinned)]);
        let tree = tempdir().unwrap();
        std::fs::write(tree.path().join(".gitmodules"), gitmodules).unwrap();

        let runner = SystemRunner::new();
        let git = GitCli::new(&runner, Duration::from_secs(60));
        let reporter = RecordingReporter::new();
        let result = resolve(&git, parent.git_dir(), &commit, tree.path(), &reporter);
        assert!(matches!(result, Err(SubmoduleError::Git { .. })));
        assert!(!tree.path().join("gone").exists());
    }
}
