//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The store file is corrupted.
    #[error("store corrupted: {0}")]
    Corrupted(String),

    /// A stored value has an unexpected shape for the requested type.
    #[error("value for key '{key}' has unexpected length {len}")]
    InvalidValue {
        /// Key that was read.
        key: String,
        /// Length of the stored value in bytes.
        len: usize,
    },

    /// Another process holds the store lock.
    #[error("store is locked by another process")]
    Locked,
}
