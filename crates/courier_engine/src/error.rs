//! Error types for the sync engine.

use courier_storage::StorageError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Failure classes that retry policies are written against.
///
/// The runner never looks at error content, only at the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorKind {
    /// Generic backend failure; retryable under the default policy.
    TransientBackend,
    /// The backend rejected the request as semantically invalid.
    InvalidParameter,
    /// Anything else, including connection failures.
    Unknown,
    /// The caller lacks a server-assigned registration id.
    NoValidRegistration,
    /// The work was cancelled before an attempt; not a failure.
    Cancelled,
}

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The backend reported a generic failure.
    #[error("backend error: {message}")]
    TransientBackend {
        /// Error message.
        message: String,
    },

    /// The backend rejected the request parameters.
    #[error("invalid parameter: {message}")]
    InvalidParameter {
        /// Error message.
        message: String,
    },

    /// Unclassified failure.
    #[error("unknown error: {message}")]
    Unknown {
        /// Error message.
        message: String,
    },

    /// No registration id is available yet.
    #[error("no valid registration")]
    NoValidRegistration,

    /// The work was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// Durable storage failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A persisted record could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),
}

impl SyncError {
    /// Creates a transient backend error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientBackend {
            message: message.into(),
        }
    }

    /// Creates an invalid parameter error.
    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    /// Creates an unknown error.
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::Unknown {
            message: message.into(),
        }
    }

    /// Returns the failure class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::TransientBackend { .. } => ErrorKind::TransientBackend,
            SyncError::InvalidParameter { .. } => ErrorKind::InvalidParameter,
            SyncError::NoValidRegistration => ErrorKind::NoValidRegistration,
            SyncError::Cancelled => ErrorKind::Cancelled,
            SyncError::Unknown { .. } | SyncError::Storage(_) | SyncError::Codec(_) => {
                ErrorKind::Unknown
            }
        }
    }

    /// Returns true if the default policy would retry this error.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::TransientBackend
    }
}
