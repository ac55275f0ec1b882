//! Index error types.

use std::io;

use thiserror::Error;
use trove_types::{FaultKind, RemoteError};

/// Index error type.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Object, monitor or mountpoint not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Predicate references an attribute that is not queryable for the type,
    /// or carries a malformed pattern.
    #[error("invalid predicate: {0}")]
    InvalidPredicate(String),

    /// Request is well-formed but cannot be applied.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Configuration file could not be read or parsed.
    #[error("config error: {0}")]
    Config(String),

    /// SQLite error.
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    /// Attribute payload could not be (de)serialized.
    #[error("encoding error: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem watcher error.
    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The index actor has shut down.
    #[error("index shut down")]
    Shutdown,
}

impl IndexError {
    /// Create a NotFound error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Create an InvalidPredicate error.
    pub fn invalid_predicate(msg: impl Into<String>) -> Self {
        Self::InvalidPredicate(msg.into())
    }

    /// Create an InvalidRequest error.
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create a Config error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// The fault kind reported to remote callers.
    pub fn fault_kind(&self) -> FaultKind {
        match self {
            Self::NotFound(_) => FaultKind::NotFound,
            Self::InvalidPredicate(_) => FaultKind::InvalidPredicate,
            Self::InvalidRequest(_) => FaultKind::InvalidRequest,
            _ => FaultKind::Internal,
        }
    }
}

impl From<IndexError> for RemoteError {
    fn from(e: IndexError) -> Self {
        RemoteError::new(e.fault_kind(), e.to_string())
    }
}

/// Index result type.
pub type IndexResult<T> = Result<T, IndexError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fault_kinds() {
        assert_eq!(IndexError::not_found("audio:1").fault_kind(), FaultKind::NotFound);
        assert_eq!(
            IndexError::invalid_predicate("bitrate").fault_kind(),
            FaultKind::InvalidPredicate
        );
        assert_eq!(IndexError::Shutdown.fault_kind(), FaultKind::Internal);
    }

    #[test]
    fn remote_error_keeps_message() {
        let remote: RemoteError = IndexError::invalid_predicate("bitrate").into();
        assert_eq!(remote.kind, FaultKind::InvalidPredicate);
        assert_eq!(remote.message, "invalid predicate: bitrate");
    }
}
