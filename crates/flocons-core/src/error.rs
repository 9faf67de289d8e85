//! Error taxonomy shared across the storage, cluster, and http layers.

use thiserror::Error;

/// The full set of errors a storage or transport operation can fail with.
///
/// Every variant maps to exactly one HTTP status code (see
/// `flocons-http::util::error_to_status`) and, on the local filesystem
/// path, to exactly one `std::io::ErrorKind`.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("is a directory: {0}")]
    IsDir(String),

    #[error("not a directory: {0}")]
    IsNotDir(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("transport error ({status}): {message}")]
    Transport { status: u16, message: String },

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
}

impl StorageError {
    pub fn not_found(path: impl Into<String>) -> Self {
        StorageError::NotFound(path.into())
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        StorageError::Internal(reason.into())
    }

    pub fn transport(status: u16, message: impl Into<String>) -> Self {
        StorageError::Transport {
            status,
            message: message.into(),
        }
    }

    /// True when this error came back from a peer node over HTTP.
    pub fn is_transport(&self) -> bool {
        matches!(self, StorageError::Transport { .. })
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => StorageError::NotFound(e.to_string()),
            std::io::ErrorKind::PermissionDenied => StorageError::Permission(e.to_string()),
            std::io::ErrorKind::AlreadyExists => StorageError::AlreadyExists(e.to_string()),
            _ => StorageError::Internal(e.to_string()),
        }
    }
}
