//! Typed errors for the places where callers branch on the kind of failure.
//!
//! Most of the crate returns [`anyhow::Result`] with context attached, the same
//! way the I/O layer does. Two failure families need to be matched on instead:
//!
//! - [`ConfigError`]: pre-flight validation. Raised before any worker starts so
//!   the CLI can exit non-zero without touching the filesystem or the index.
//! - [`BulkError`]: a bulk request that failed as a whole. The sync engine asks
//!   it whether it is worth retrying ([`BulkError::is_transient`]) and how to
//!   classify the documents it carried ([`BulkError::class`]).

use crate::sync::errors::FailureClass;
use std::path::PathBuf;
use thiserror::Error;

/// Pre-flight validation failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{field} is out of range: {reason}")]
    OutOfRange { field: &'static str, reason: String },

    #[error("'{}' is not a valid directory", .0.display())]
    NotADirectory(PathBuf),

    #[error("'{}' is missing expected items: {}", .path.display(), .missing.join(", "))]
    MissingItems { path: PathBuf, missing: Vec<String> },

    #[error("unsupported schema type '{data_type}' for field '{field}'")]
    UnsupportedType { field: String, data_type: String },

    #[error("invalid configuration file '{}': {reason}", .path.display())]
    File { path: PathBuf, reason: String },
}

/// A bulk request that failed before per-document verdicts were available.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BulkError {
    /// The index service answered with a non-success status for the whole request.
    #[error("bulk request rejected with HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Connection refused, reset, DNS failure and similar.
    #[error("bulk transport error: {0}")]
    Transport(String),

    /// The client-side request timeout elapsed.
    #[error("bulk request timed out")]
    Timeout,

    /// The response could not be decoded or did not line up with the request.
    #[error("malformed bulk response: {0}")]
    Decode(String),
}

impl BulkError {
    /// Whether resubmitting the same chunk may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http { status, .. } => is_transient_status(*status),
            Self::Transport(_) | Self::Timeout => true,
            Self::Decode(_) => false,
        }
    }

    /// Failure class recorded for every document carried by the failed request.
    #[must_use]
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Http { status, .. } => FailureClass::Status(*status),
            Self::Transport(_) | Self::Timeout | Self::Decode(_) => FailureClass::Transport,
        }
    }
}

/// Throttling and server-side statuses are retried; everything else is final.
#[must_use]
pub fn is_transient_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}
