/**
 * Server Error Types
 *
 * Errors are grouped by where they originate: storage (local filesystem or
 * WOPI host) and the document broker itself. Storage errors carry enough
 * classification to pick the wire `error: cmd=storage kind=…` frame without
 * inspecting messages.
 */

use crate::protocol::UriError;
use thiserror::Error;

/// Errors from the storage binding.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The storage host could not be reached or answered 5xx.
    #[error("storage connection failed: {message}")]
    Connection {
        /// Human-readable error message
        message: String,
    },

    /// The access token was rejected (401/403) or replayed.
    #[error("storage refused access: {message}")]
    Unauthorized {
        /// Human-readable error message
        message: String,
    },

    /// The storage is out of space (507/413 or local disk full).
    #[error("storage out of space: {message}")]
    DiskFull {
        /// Human-readable error message
        message: String,
    },

    /// The file-info document was missing or malformed.
    #[error("invalid file info: {message}")]
    BadFileInfo {
        /// Human-readable error message
        message: String,
    },

    /// Local filesystem failure while staging the document.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// HTTP transport failure talking to the WOPI host.
    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// Token ledger failure.
    #[error(transparent)]
    Ledger(#[from] sqlx::Error),
}

impl StorageError {
    /// Create a new connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a new unauthorized error
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: message.into(),
        }
    }

    /// Create a new disk-full error
    pub fn disk_full(message: impl Into<String>) -> Self {
        Self::DiskFull {
            message: message.into(),
        }
    }

    /// The `kind=` value for a save-time `error: cmd=storage` frame.
    pub fn save_error_kind(&self) -> &'static str {
        match self {
            Self::Unauthorized { .. } => "saveunauthorized",
            Self::DiskFull { .. } => "savediskfull",
            _ => "savefailed",
        }
    }
}

/// Errors from the document broker.
#[derive(Debug, Error)]
pub enum DocError {
    /// The public URI could not be sanitized.
    #[error(transparent)]
    Uri(#[from] UriError),

    /// Storage failure during load or save.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// No kit process could be acquired within the deadline.
    #[error("no kit process available for document")]
    KitUnavailable,

    /// The broker is tearing down and refuses new sessions.
    #[error("document is marked to destroy")]
    MarkedToDestroy,

    /// The document failed to load.
    #[error("failed to load document: {message}")]
    LoadFailed {
        /// Human-readable error message
        message: String,
    },

    /// The addressed session is not in the broker's session map.
    #[error("session [{id}] not found")]
    SessionNotFound {
        /// The missing session id
        id: String,
    },

    /// The broker task exited before answering.
    #[error("document broker is gone")]
    BrokerGone,
}

impl DocError {
    /// Create a new load-failure error
    pub fn load_failed(message: impl Into<String>) -> Self {
        Self::LoadFailed {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_error_kind_mapping() {
        assert_eq!(StorageError::connection("down").save_error_kind(), "savefailed");
        assert_eq!(StorageError::unauthorized("401").save_error_kind(), "saveunauthorized");
        assert_eq!(StorageError::disk_full("507").save_error_kind(), "savediskfull");
    }

    #[test]
    fn test_doc_error_from_storage() {
        let err: DocError = StorageError::unauthorized("token replayed").into();
        match err {
            DocError::Storage(StorageError::Unauthorized { message }) => {
                assert!(message.contains("replayed"));
            }
            _ => panic!("Expected Storage(Unauthorized)"),
        }
    }

    #[test]
    fn test_error_display() {
        let err = DocError::load_failed("boom");
        assert!(format!("{}", err).contains("boom"));
    }
}
