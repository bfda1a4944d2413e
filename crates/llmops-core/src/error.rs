//! Error kinds shared by every service layer.
//!
//! Collaborator traits return [`anyhow::Result`]; the `?` operator folds
//! those failures into [`Error::Transient`]. Everything else is raised
//! explicitly with the kind that describes it.

use thiserror::Error;

/// Coarse classification of an [`Error`], used by callers to map failures
/// onto their own surface (HTTP status, CLI exit code, event payload).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Forbidden,
    Conflict,
    Transient,
    Fatal,
    Cancelled,
}

/// Main error type for llmops services.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed request or a graph that fails structural rules.
    #[error("validation error: {0}")]
    Validation(String),

    /// Missing document, workflow, dataset, or referenced sub-workflow.
    #[error("not found: {0}")]
    NotFound(String),

    /// The resource belongs to another account.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Uniqueness violation, e.g. a duplicate tool call name.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Vector-store, object-store, model, or bus I/O failure.
    #[error("transient error: {0}")]
    Transient(#[from] anyhow::Error),

    /// Invariant breach, e.g. a cycle in a graph that passed validation.
    #[error("fatal error: {0}")]
    Fatal(String),

    /// The caller's context was cancelled.
    #[error("cancelled")]
    Cancelled,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Forbidden(_) => ErrorKind::Forbidden,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::Transient(_) => ErrorKind::Transient,
            Error::Fatal(_) => ErrorKind::Fatal,
            Error::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn transient(msg: impl std::fmt::Display) -> Self {
        Error::Transient(anyhow::anyhow!("{}", msg))
    }
}

/// Convenient Result type using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Validation(err.to_string())
    }
}
