//! Cache keys extracted from dependency lock files.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;

const MAX_KEY_LEN: usize = 128;

/// Errors returned while reading a lock file.
#[derive(Error, Debug)]
pub enum LockfileError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{path} has no string field '{field}'")]
    MissingField { path: PathBuf, field: String },
    #[error("lock hash '{0}' is not usable as a cache key")]
    InvalidKey(String),
}

/// Content hash of a resolved dependency set, used as a directory name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Accepts `[A-Za-z0-9._-]`, not starting with `.`.
    pub fn new(value: &str) -> Result<Self, LockfileError> {
        let valid = !value.is_empty()
            && value.len() <= MAX_KEY_LEN
            && !value.starts_with('.')
            && value
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if valid {
            Ok(Self(value.to_string()))
        } else {
            Err(LockfileError::InvalidKey(value.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Read the top-level `field` of the JSON lock file at `path`.
pub fn read_cache_key(path: &Path, field: &str) -> Result<CacheKey, LockfileError> {
    let text = std::fs::read_to_string(path).map_err(|source| LockfileError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let document: Value = serde_json::from_str(&text).map_err(|source| LockfileError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    let hash = document
        .get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| LockfileError::MissingField {
            path: path.to_path_buf(),
            field: field.to_string(),
        })?;
    CacheKey::new(hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn reads_hash_field() {
        let dir = tempdir().unwrap();
        let lock = dir.path().join("composer.lock");
        std::fs::write(
            &lock,
            r#"{"_readme":["generated"],"hash":"abc123","packages":[]}"#,
        )
        .unwrap();

        let key = read_cache_key(&lock, "hash").unwrap();
        assert_eq!(key.as_str(), "abc123");
        assert_eq!(key.to_string(), "abc123");
    }

    #[test]
    fn missing_or_non_string_field() {
        let dir = tempdir().unwrap();
        let lock = dir.path().join("composer.lock");
        std::fs::write(&lock, r#"{"content-hash":"abc","hash":7}"#).unwrap();

        assert!(matches!(
            read_cache_key(&lock, "hash"),
            Err(LockfileError::MissingField { .. })
        ));
        assert_eq!(
            read_cache_key(&lock, "content-hash").unwrap().as_str(),
            "abc"
        );
    }

    #[test]
    fn unparseable_lock_file() {
        let dir = tempdir().unwrap();
        let lock = dir.path().join("composer.lock");
        std::fs::write(&lock, "hash = abc").unwrap();
        assert!(matches!(
            read_cache_key(&lock, "hash"),
            Err(LockfileError::Parse { .. })
        ));
    }

    #[test]
    fn key_must_be_a_safe_directory_name() {
        assert!(CacheKey::new("d41d8cd98f00b204e9800998ecf8427e").is_ok());
        assert!(CacheKey::new("v1.2_build-3").is_ok());
        for bad in ["", "..", ".hidden", "a/b", "../../etc", "has space"] {
            assert!(CacheKey::new(bad).is_err(), "accepted {bad:?}");
        }
        assert!(CacheKey::new(&"a".repeat(MAX_KEY_LEN + 1)).is_err());
    }
}
