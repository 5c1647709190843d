//! Error types for Strata operations.
//!
//! Errors are categorized into three main types:
//!
//! - **`Error`**: Top-level errors that halt an operation (registry failures,
//!   migrations, bad configuration)
//! - **`SearchError`**: Per-directory or per-candidate problems that are
//!   collected in [`SearchStats`](crate::SearchStats) but never abort a search
//! - **`CollaboratorError`**: Failures of external services (embedder,
//!   reranker, call-hierarchy provider). Each cascade stage maps these to a
//!   degraded behaviour instead of failing.
//!
//! ## Error Categorization
//!
//! `SearchErrorKind` uses a 4xx/5xx style categorization:
//! - Input problems: invalid candidate paths, cross-drive references
//! - Internal problems: storage failures, external service failures, timeouts

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type for Strata operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for Strata operations.
///
/// These errors represent failures that prevent the operation from completing.
#[derive(Debug, Error)]
pub enum Error {
    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// File system operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration, unknown project, or bad arguments
    #[error("configuration error: {0}")]
    Config(String),

    /// A requested entity does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller supplied malformed input (wrong vector width, bad line range)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A schema upgrade step failed; every pending step was rolled back
    #[error("migration {version} ({name}) failed: {source}")]
    Migration {
        /// Version number of the failing step.
        version: u32,
        /// Human-readable step name.
        name: &'static str,
        /// Underlying database error.
        #[source]
        source: rusqlite::Error,
    },

    /// JSON (de)serialization of stored metadata failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal invariant violated (poisoned lock, worker thread panic)
    #[error("internal error: {0}")]
    Internal(String),
}

/// Non-fatal problem recorded while searching.
///
/// These are collected in [`SearchStats::errors`](crate::SearchStats) and
/// surfaced only in statistics or verbose output.
#[derive(Debug, Clone)]
pub struct SearchError {
    /// Directory index, file, or candidate the problem relates to
    pub path: PathBuf,
    /// Category of the error
    pub kind: SearchErrorKind,
    /// Human-readable error message
    pub message: String,
}

impl std::fmt::Display for SearchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} ({})",
            self.path.display(),
            self.message,
            self.kind
        )
    }
}

impl std::error::Error for SearchError {}

/// Categorization of non-fatal search errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchErrorKind {
    // === Input Problems (analogous to HTTP 4xx) ===
    /// Candidate path failed validation (null byte, other drive, outside root)
    InvalidPath,

    // === Internal Problems (analogous to HTTP 5xx) ===
    /// A directory index could not be opened or queried
    Storage,

    /// An external collaborator failed
    ExternalService,

    /// A stage exceeded its time budget
    Timeout,
}

impl std::fmt::Display for SearchErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidPath => write!(f, "invalid path"),
            Self::Storage => write!(f, "storage error"),
            Self::ExternalService => write!(f, "external service error"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

impl SearchErrorKind {
    /// Returns `true` if this is an input problem (4xx-style).
    #[must_use]
    pub fn is_input_error(&self) -> bool {
        matches!(self, Self::InvalidPath)
    }

    /// Returns `true` if this is an internal problem (5xx-style).
    #[must_use]
    pub fn is_internal_error(&self) -> bool {
        !self.is_input_error()
    }
}

impl SearchError {
    /// Create a new search error.
    #[must_use]
    pub fn new(path: PathBuf, kind: SearchErrorKind, message: impl Into<String>) -> Self {
        Self {
            path,
            kind,
            message: message.into(),
        }
    }

    /// Create a storage error for a directory index.
    #[must_use]
    pub fn storage(path: PathBuf, error: &Error) -> Self {
        Self::new(path, SearchErrorKind::Storage, error.to_string())
    }

    /// Create an external-service error.
    #[must_use]
    pub fn external(path: PathBuf, error: &CollaboratorError) -> Self {
        let kind = match error {
            CollaboratorError::Timeout(_) => SearchErrorKind::Timeout,
            _ => SearchErrorKind::ExternalService,
        };
        Self::new(path, kind, error.to_string())
    }
}

/// A file that could not be indexed.
///
/// Collected in [`IndexStats::errors`](crate::IndexStats); the rest of the
/// directory is still written.
#[derive(Debug, Clone)]
pub struct IndexError {
    /// File that failed
    pub path: PathBuf,
    /// Human-readable error message
    pub message: String,
}

impl IndexError {
    /// Create a new indexing error.
    #[must_use]
    pub fn new(path: PathBuf, message: impl Into<String>) -> Self {
        Self {
            path,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for IndexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.message)
    }
}

/// Failure reported by an external collaborator.
#[derive(Debug, Clone, Error)]
pub enum CollaboratorError {
    /// The collaborator is not configured or its backing process is missing
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),

    /// The call did not complete within its time budget
    #[error("collaborator timed out after {0:?}")]
    Timeout(Duration),

    /// The collaborator returned an error
    #[error("collaborator failed: {0}")]
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_error_kind_categorization() {
        assert!(SearchErrorKind::InvalidPath.is_input_error());
        assert!(!SearchErrorKind::InvalidPath.is_internal_error());

        assert!(SearchErrorKind::Storage.is_internal_error());
        assert!(SearchErrorKind::ExternalService.is_internal_error());
        assert!(SearchErrorKind::Timeout.is_internal_error());
    }

    #[test]
    fn search_error_display_includes_path_and_kind() {
        let error = SearchError::new(
            PathBuf::from("/p/src/_index.db"),
            SearchErrorKind::Storage,
            "database is locked",
        );

        let display = error.to_string();
        assert!(display.contains("/p/src/_index.db"));
        assert!(display.contains("database is locked"));
        assert!(display.contains("storage error"));
    }

    #[test]
    fn external_timeout_maps_to_timeout_kind() {
        let err = SearchError::external(
            PathBuf::from("reranker"),
            &CollaboratorError::Timeout(Duration::from_millis(10)),
        );
        assert_eq!(err.kind, SearchErrorKind::Timeout);

        let err = SearchError::external(
            PathBuf::from("reranker"),
            &CollaboratorError::Failed("boom".to_string()),
        );
        assert_eq!(err.kind, SearchErrorKind::ExternalService);
    }
}
