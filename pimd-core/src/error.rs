//! Error types for pimd backends.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur in backend operations.
///
/// Values are `Clone` so a single failure can be delivered to an operation
/// handle and to every live view that is waiting on a completion signal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("Backend is not opened yet")]
    NotOpened,

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Repository is offline")]
    RepositoryOffline,

    #[error("Out of sync: {0}")]
    OutOfSync(String),

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Permission denied: backend is read-only")]
    PermissionDenied,

    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    #[error("Object ID already exists: {0}")]
    ObjectIdAlreadyExists(String),

    #[error("Invalid object: {0}")]
    InvalidObject(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Unknown operation {0}")]
    UnknownOperation(u32),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Provider '{0}' not found in PATH")]
    ProviderNotInstalled(String),

    #[error("Provider request timed out after {0}s")]
    ProviderTimeout(u64),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("{0}")]
    Other(String),
}

impl From<std::io::Error> for BackendError {
    fn from(e: std::io::Error) -> Self {
        BackendError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for BackendError {
    fn from(e: serde_json::Error) -> Self {
        BackendError::Serialization(e.to_string())
    }
}

/// Coarse error classification shared with provider binaries.
///
/// Every [`BackendError`] folds into one of these; providers report one of
/// them alongside their message so the engine can tell a conflict from a
/// plain failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotOpened,
    NotSupported,
    RepositoryOffline,
    OutOfSync,
    Cancelled,
    InvalidArgument,
    ObjectNotFound,
    Other,
}

impl BackendError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BackendError::NotOpened => ErrorKind::NotOpened,
            BackendError::NotSupported(_) => ErrorKind::NotSupported,
            BackendError::RepositoryOffline => ErrorKind::RepositoryOffline,
            BackendError::OutOfSync(_) => ErrorKind::OutOfSync,
            BackendError::Cancelled => ErrorKind::Cancelled,
            BackendError::ObjectNotFound(_) => ErrorKind::ObjectNotFound,
            BackendError::InvalidArgument(_)
            | BackendError::InvalidObject(_)
            | BackendError::InvalidQuery(_)
            | BackendError::ObjectIdAlreadyExists(_)
            | BackendError::UnknownOperation(_) => ErrorKind::InvalidArgument,
            _ => ErrorKind::Other,
        }
    }

    /// Rebuild an error from a kind and message reported by a provider.
    pub fn from_kind(kind: ErrorKind, message: String) -> Self {
        match kind {
            ErrorKind::NotOpened => BackendError::NotOpened,
            ErrorKind::NotSupported => BackendError::NotSupported(message),
            ErrorKind::RepositoryOffline => BackendError::RepositoryOffline,
            ErrorKind::OutOfSync => BackendError::OutOfSync(message),
            ErrorKind::Cancelled => BackendError::Cancelled,
            ErrorKind::InvalidArgument => BackendError::InvalidArgument(message),
            ErrorKind::ObjectNotFound => BackendError::ObjectNotFound(message),
            ErrorKind::Other => BackendError::Provider(message),
        }
    }
}

/// Result type alias for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supplementary_errors_fold_into_kinds() {
        assert_eq!(
            BackendError::InvalidObject("x".into()).kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(BackendError::Io("disk".into()).kind(), ErrorKind::Other);
        assert_eq!(BackendError::Cancelled.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_provider_kind_round_trips_conflicts() {
        let err = BackendError::from_kind(ErrorKind::OutOfSync, "etag mismatch".into());
        assert_eq!(err, BackendError::OutOfSync("etag mismatch".into()));
        assert_eq!(err.kind(), ErrorKind::OutOfSync);
    }
}
