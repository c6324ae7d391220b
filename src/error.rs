//! Named error kinds shared across the crate.
//!
//! Every operation that performs I/O or parses a persisted document fails
//! with one of these variants rather than an ad-hoc string, so callers
//! (the staging-state controller, a UI layer) can branch on the kind
//! without string-matching.

use std::path::PathBuf;

use thiserror::Error;

/// The crate-wide error type.
///
/// Each variant carries enough context (path, operation name, inner
/// message) to produce a human-readable string without the caller
/// needing to know which underlying syscall or library failed.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{operation} failed for {path}: {message}")]
    PathIo {
        operation: &'static str,
        path: PathBuf,
        message: String,
    },

    #[error("archive error ({operation}) for {path}: {message}")]
    Archive {
        operation: &'static str,
        path: PathBuf,
        message: String,
    },

    #[error("failed to parse {path} (key: {key}): {message}")]
    Parse {
        path: PathBuf,
        key: String,
        message: String,
    },

    #[error("two distinct sources map to the destination {path}: {first} and {second}")]
    DuplicatePath {
        path: PathBuf,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("unknown {kind} type: {name}")]
    UnknownType { kind: &'static str, name: String },

    #[error("cryptography error during {operation}: {message}")]
    Cryptography {
        operation: &'static str,
        message: String,
    },

    #[error("no such {kind}: {id}")]
    NoSuchItem { kind: &'static str, id: String },
}

impl CoreError {
    pub fn path_io(operation: &'static str, path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        Self::PathIo {
            operation,
            path: path.into(),
            message: err.to_string(),
        }
    }

    pub fn archive(operation: &'static str, path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        Self::Archive {
            operation,
            path: path.into(),
            message: err.to_string(),
        }
    }

    pub fn parse(path: impl Into<PathBuf>, key: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Parse {
            path: path.into(),
            key: key.into(),
            message: err.to_string(),
        }
    }

    pub fn no_such(kind: &'static str, id: impl std::fmt::Display) -> Self {
        Self::NoSuchItem {
            kind,
            id: id.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
