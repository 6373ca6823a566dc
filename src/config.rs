//! Hook configuration.
//!
//! A [`HookConfig`] is built once per invocation from an optional JSON file
//! and command-line overrides, then passed by reference to every stage. It is
//! never mutated afterwards.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::paths::{BuildPaths, validate_relative_path};

/// Default branch whose pushes are deployed
pub const DEFAULT_BRANCH: &str = "master";
/// Default name of the build descriptor at the project root
pub const DEFAULT_DESCRIPTOR_FILE: &str = "buildfile.json";

/// Errors returned while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("build_root is not configured (pass --build-root or set it in the config file)")]
    MissingBuildRoot,
    #[error("failed to resolve {field} '{path}': {source}")]
    Resolve {
        field: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// How the external dependency tool is invoked and what it produces.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DependencyConfig {
    /// Program and arguments, run inside the dependency working directory
    pub command: Vec<String>,
    /// Manifest file that must exist in the working directory
    pub manifest: String,
    /// Lock file that must exist in the working directory
    pub lock_file: String,
    /// Directory the tool populates, moved into the cache afterwards
    pub output_dir: String,
    /// Top-level lock file field used as the cache key
    pub hash_field: String,
}

impl Default for DependencyConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "composer".to_string(),
                "install".to_string(),
                "--no-interaction".to_string(),
            ],
            manifest: "composer.json".to_string(),
            lock_file: "composer.lock".to_string(),
            output_dir: "vendor".to_string(),
            hash_field: "hash".to_string(),
        }
    }
}

/// Subprocess and lock timeouts, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Timeouts {
    pub git_secs: u64,
    pub dependency_secs: u64,
    pub restart_secs: u64,
    pub lock_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            git_secs: 300,
            dependency_secs: 1800,
            restart_secs: 300,
            lock_secs: 300,
        }
    }
}

impl Timeouts {
    pub fn git(&self) -> Duration {
        Duration::from_secs(self.git_secs)
    }

    pub fn dependency(&self) -> Duration {
        Duration::from_secs(self.dependency_secs)
    }

    pub fn restart(&self) -> Duration {
        Duration::from_secs(self.restart_secs)
    }

    pub fn lock(&self) -> Duration {
        Duration::from_secs(self.lock_secs)
    }
}

/// On-disk representation. Everything optional so CLI flags can fill gaps.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    build_root: Option<PathBuf>,
    git_dir: Option<PathBuf>,
    deployable_branch: Option<String>,
    descriptor_file: Option<String>,
    staging_dir: Option<PathBuf>,
    dependency_cache_dir: Option<PathBuf>,
    #[serde(default)]
    namespace_cache_by_project: bool,
    #[serde(default)]
    dependency: DependencyConfig,
    restart_command: Option<Vec<String>>,
    #[serde(default)]
    timeouts: Timeouts,
}

/// Command-line values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub build_root: Option<PathBuf>,
    pub git_dir: Option<PathBuf>,
    pub branch: Option<String>,
}

/// Resolved configuration for one hook invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookConfig {
    pub build_root: PathBuf,
    pub git_dir: PathBuf,
    pub deployable_branch: String,
    pub descriptor_file: String,
    pub staging_dir: Option<PathBuf>,
    pub dependency_cache_dir: Option<PathBuf>,
    pub namespace_cache_by_project: bool,
    pub dependency: DependencyConfig,
    pub restart_command: Option<Vec<String>>,
    pub timeouts: Timeouts,
}

impl HookConfig {
    /// Configuration with every default filled in.
    pub fn new(build_root: impl Into<PathBuf>, git_dir: impl Into<PathBuf>) -> Self {
        Self {
            build_root: build_root.into(),
            git_dir: git_dir.into(),
            deployable_branch: DEFAULT_BRANCH.to_string(),
            descriptor_file: DEFAULT_DESCRIPTOR_FILE.to_string(),
            staging_dir: None,
            dependency_cache_dir: None,
            namespace_cache_by_project: false,
            dependency: DependencyConfig::default(),
            restart_command: None,
            timeouts: Timeouts::default(),
        }
    }

    /// Load from `path` (if any), apply overrides, resolve paths and validate.
    pub fn load(path: Option<&Path>, overrides: Overrides) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            None => ConfigFile::default(),
        };
        Self::from_file(file, overrides)
    }

    /// Parse a JSON document directly. Used by tests and `load`.
    pub fn from_json(text: &str, overrides: Overrides) -> Result<Self, ConfigError> {
        let file: ConfigFile =
            serde_json::from_str(text).map_err(|source| ConfigError::Parse {
                path: PathBuf::from("<inline>"),
                source,
            })?;
        Self::from_file(file, overrides)
    }

    fn from_file(file: ConfigFile, overrides: Overrides) -> Result<Self, ConfigError> {
        let build_root = overrides
            .build_root
            .or(file.build_root)
            .ok_or(ConfigError::MissingBuildRoot)?;
        let git_dir = overrides
            .git_dir
            .or(file.git_dir)
            .or_else(|| std::env::var_os("GIT_DIR").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("."));

        let config = Self {
            build_root: absolutize("build_root", &build_root)?,
            git_dir: absolutize("git_dir", &git_dir)?,
            deployable_branch: overrides
                .branch
                .or(file.deployable_branch)
                .unwrap_or_else(|| DEFAULT_BRANCH.to_string()),
            descriptor_file: file
                .descriptor_file
                .unwrap_or_else(|| DEFAULT_DESCRIPTOR_FILE.to_string()),
            staging_dir: file
                .staging_dir
                .map(|p| absolutize("staging_dir", &p))
                .transpose()?,
            dependency_cache_dir: file
                .dependency_cache_dir
                .map(|p| absolutize("dependency_cache_dir", &p))
                .transpose()?,
            namespace_cache_by_project: file.namespace_cache_by_project,
            dependency: file.dependency,
            restart_command: file.restart_command,
            timeouts: file.timeouts,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let branch = &self.deployable_branch;
        if branch.is_empty() || branch.contains('/') || branch.chars().any(char::is_whitespace) {
            return Err(ConfigError::Invalid {
                field: "deployable_branch",
                reason: format!("'{branch}' is not a plain branch name"),
            });
        }

        validate_relative_path(&self.descriptor_file).map_err(|e| ConfigError::Invalid {
            field: "descriptor_file",
            reason: e.to_string(),
        })?;

        if self.dependency.command.is_empty() || self.dependency.command[0].is_empty() {
            return Err(ConfigError::Invalid {
                field: "dependency.command",
                reason: "must name a program".to_string(),
            });
        }
        for (field, value) in [
            ("dependency.manifest", &self.dependency.manifest),
            ("dependency.lock_file", &self.dependency.lock_file),
            ("dependency.output_dir", &self.dependency.output_dir),
        ] {
            validate_relative_path(value).map_err(|e| ConfigError::Invalid {
                field,
                reason: e.to_string(),
            })?;
        }
        if self.dependency.hash_field.is_empty() {
            return Err(ConfigError::Invalid {
                field: "dependency.hash_field",
                reason: "must not be empty".to_string(),
            });
        }

        if let Some(command) = &self.restart_command {
            if command.is_empty() || command[0].is_empty() {
                return Err(ConfigError::Invalid {
                    field: "restart_command",
                    reason: "must name a program".to_string(),
                });
            }
        }

        if self.timeouts.git_secs == 0
            || self.timeouts.dependency_secs == 0
            || self.timeouts.restart_secs == 0
        {
            return Err(ConfigError::Invalid {
                field: "timeouts",
                reason: "subprocess timeouts must be at least one second".to_string(),
            });
        }
        Ok(())
    }

    /// Filesystem layout for this configuration.
    pub fn build_paths(&self) -> BuildPaths {
        let mut paths = BuildPaths::new(&self.build_root);
        if let Some(staging) = &self.staging_dir {
            paths = paths.with_staging_dir(staging);
        }
        if let Some(cache) = &self.dependency_cache_dir {
            paths = paths.with_dependency_cache_dir(cache);
        }
        paths
    }
}

/// Config file used when `--config` is not given: `<config dir>/releasehook/config.json`.
///
/// Uses `dirs::config_dir()` which resolves to:
/// - Linux: `$XDG_CONFIG_HOME` or `~/.config`
/// - macOS: `~/Library/Application Support`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("releasehook").join("config.json"))
}

fn absolutize(field: &'static str, path: &Path) -> Result<PathBuf, ConfigError> {
    std::path::absolute(path).map_err(|source| ConfigError::Resolve {
        field,
        path: path.to_path_buf(),
        source,
    })
}
