//! Unified error type for the VSS-to-Git conversion engine.
//!
//! One variant per failure kind in the design's error-handling section.
//! Tree-operation errors are wrapped in [`NodeError`] so the offending
//! revision node stays attached to the message as it propagates.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, ConvertError>;

#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("path not found: {0}")]
    PathNotFound(String),

    #[error("path already exists: {0}")]
    PathAlreadyExists(String),

    #[error("wrong object kind at `{path}`: expected {expected}, found {found}")]
    WrongKind {
        path: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("copy source not found: {0}")]
    CopySourceNotFound(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("refname conflict: {0}")]
    RefnameConflict(String),

    #[error("git subprocess failed: {0}")]
    GitSubprocessFailed(String),

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Wraps a [`ConvertError`] with the revision node that was being applied
/// when the error occurred, per spec's `NODE <kind> Path: ..., action: ...`
/// annotation convention.
#[derive(Error, Debug)]
#[error("NODE {kind} Path: {path}, action: {action}: {source}")]
pub struct NodeError {
    pub kind: &'static str,
    pub path: String,
    pub action: &'static str,
    #[source]
    pub source: ConvertError,
}

impl ConvertError {
    pub fn with_node(self, kind: &'static str, path: impl Into<String>, action: &'static str) -> NodeError {
        NodeError {
            kind,
            path: path.into(),
            action,
            source: self,
        }
    }
}
