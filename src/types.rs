//! Shared types for releasehook

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for parsing failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("value cannot be empty")]
    Empty,
    #[error("invalid character in value: {0}")]
    InvalidCharacter(char),
    #[error("commit id must be a full 40 or 64 hex digit object name, got {0} digits")]
    InvalidLength(usize),
    #[error("hook line must contain exactly three fields, got {0}")]
    FieldCount(usize),
    #[error("invalid old commit id: {0}")]
    InvalidOldCommit(#[source] Box<ParseError>),
    #[error("invalid new commit id: {0}")]
    InvalidNewCommit(#[source] Box<ParseError>),
    #[error("ref name cannot be empty or end with '/'")]
    InvalidRef,
}

const SHA1_HEX_LEN: usize = 40;
const SHA256_HEX_LEN: usize = 64;

/// A git object id as received from the hook.
///
/// Validation rules:
/// - Non-empty
/// - Hexadecimal digits only
/// - Exactly 40 (SHA-1) or 64 (SHA-256) characters
///
/// Abbreviated names are refused; hooks always receive full ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommitId(String);

impl CommitId {
    /// Returns the commit id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the first ten characters, used in progress output
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(10)]
    }

    /// Whether this is the all-zero id git sends for created or deleted refs
    pub fn is_zero(&self) -> bool {
        self.0.bytes().all(|b| b == b'0')
    }
}

impl FromStr for CommitId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseError::Empty);
        }

        for c in s.chars() {
            if !c.is_ascii_hexdigit() {
                return Err(ParseError::InvalidCharacter(c));
            }
        }

        if s.len() != SHA1_HEX_LEN && s.len() != SHA256_HEX_LEN {
            return Err(ParseError::InvalidLength(s.len()));
        }

        Ok(CommitId(s.to_ascii_lowercase()))
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One ref update as delivered to a receive hook on stdin.
///
/// Format: `<old-commit> <new-commit> <ref-name>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushEvent {
    pub old_commit: CommitId,
    pub new_commit: CommitId,
    pub ref_name: String,
}

impl PushEvent {
    /// Last path segment of the ref, e.g. `master` for `refs/heads/master`
    pub fn branch_name(&self) -> &str {
        self.ref_name
            .rsplit('/')
            .next()
            .unwrap_or(self.ref_name.as_str())
    }

    /// A push that removes the ref carries an all-zero new commit
    pub fn is_deletion(&self) -> bool {
        self.new_commit.is_zero()
    }
}

impl FromStr for PushEvent {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split_whitespace().collect();
        if fields.len() != 3 {
            return Err(ParseError::FieldCount(fields.len()));
        }

        let old_commit = fields[0]
            .parse::<CommitId>()
            .map_err(|e| ParseError::InvalidOldCommit(Box::new(e)))?;
        let new_commit = fields[1]
            .parse::<CommitId>()
            .map_err(|e| ParseError::InvalidNewCommit(Box::new(e)))?;

        let ref_name = fields[2];
        if ref_name.ends_with('/') {
            return Err(ParseError::InvalidRef);
        }

        Ok(PushEvent {
            old_commit,
            new_commit,
            ref_name: ref_name.to_string(),
        })
    }
}

impl fmt::Display for PushEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.old_commit, self.new_commit, self.ref_name)
    }
}
