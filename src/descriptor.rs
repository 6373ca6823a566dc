//! The per-commit build descriptor (`buildfile.json`).
//!
//! The document is kept as a loose JSON value and queried by dotted key path,
//! so unknown keys are ignored and a missing intermediate key is simply
//! "not found". Typed accessors validate the few keys the pipeline acts on.

use std::io;
use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;

use crate::paths::{UnsafePathError, validate_relative_path};

pub const PROJECT_NAME_KEY: &str = "project.name";
pub const STORAGE_DIRS_KEY: &str = "storage.dirs";
pub const DEPENDENCY_WORKING_DIR_KEY: &str = "dependency.workingDir";
/// Older descriptors named the dependency section after the tool
pub const LEGACY_WORKING_DIR_KEY: &str = "composer.workingDir";

/// Errors returned while reading or querying a descriptor.
#[derive(Error, Debug)]
pub enum DescriptorError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("top level must be a JSON object")]
    NotAnObject,
    #[error("'{key}' must be {expected}")]
    WrongType { key: String, expected: &'static str },
    #[error("'{key}': {source}")]
    UnsafePath {
        key: String,
        #[source]
        source: UnsafePathError,
    },
}

/// Parsed build descriptor for one commit.
#[derive(Debug, Clone, PartialEq)]
pub struct BuildDescriptor {
    document: Value,
}

impl BuildDescriptor {
    /// Parse descriptor text.
    pub fn parse(text: &str) -> Result<Self, DescriptorError> {
        let document: Value = serde_json::from_str(text)?;
        if !document.is_object() {
            return Err(DescriptorError::NotAnObject);
        }
        Ok(Self { document })
    }

    /// Read and parse a descriptor file.
    pub fn from_file(path: &Path) -> Result<Self, DescriptorError> {
        let text = std::fs::read_to_string(path).map_err(|source| DescriptorError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Look up a dotted key path such as `project.name`.
    pub fn key(&self, dotted: &str) -> Option<&Value> {
        dotted
            .split('.')
            .try_fold(&self.document, |node, part| node.as_object()?.get(part))
    }

    /// `project.name`, if present as a non-empty string.
    pub fn project_name(&self) -> Option<&str> {
        self.key(PROJECT_NAME_KEY)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }

    /// `storage.dirs` as validated relative paths. `None` when absent.
    pub fn storage_dirs(&self) -> Result<Option<Vec<PathBuf>>, DescriptorError> {
        let Some(value) = self.key(STORAGE_DIRS_KEY) else {
            return Ok(None);
        };
        let wrong_type = || DescriptorError::WrongType {
            key: STORAGE_DIRS_KEY.to_string(),
            expected: "a list of path strings",
        };

        let items = value.as_array().ok_or_else(wrong_type)?;
        let mut dirs = Vec::with_capacity(items.len());
        for item in items {
            let raw = item.as_str().ok_or_else(wrong_type)?;
            let path = validate_relative_path(raw).map_err(|source| {
                DescriptorError::UnsafePath {
                    key: STORAGE_DIRS_KEY.to_string(),
                    source,
                }
            })?;
            if path.as_os_str().is_empty() {
                return Err(DescriptorError::UnsafePath {
                    key: STORAGE_DIRS_KEY.to_string(),
                    source: UnsafePathError::Empty,
                });
            }
            dirs.push(path);
        }
        Ok(Some(dirs))
    }

    /// Dependency working directory; `None` means dependency resolution is skipped.
    ///
    /// An empty path means the project root.
    pub fn dependency_working_dir(&self) -> Result<Option<PathBuf>, DescriptorError> {
        let (key, value) = match self.key(DEPENDENCY_WORKING_DIR_KEY) {
            Some(value) => (DEPENDENCY_WORKING_DIR_KEY, value),
            None => match self.key(LEGACY_WORKING_DIR_KEY) {
                Some(value) => (LEGACY_WORKING_DIR_KEY, value),
                None => return Ok(None),
            },
        };

        let raw = value.as_str().ok_or_else(|| DescriptorError::WrongType {
            key: key.to_string(),
            expected: "a path string",
        })?;
        validate_relative_path(raw)
            .map(Some)
            .map_err(|source| DescriptorError::UnsafePath {
                key: key.to_string(),
                source,
            })
    }
}
