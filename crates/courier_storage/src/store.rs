//! Key-value store trait definition.

use crate::error::{StorageError, StorageResult};

/// A durable key-value store for the sync engine.
///
/// Two independent namespaces share the same key space:
///
/// - **Entry lists**: ordered lists of byte strings, appended to and drained
///   atomically with [`read_and_clear_entries`](Self::read_and_clear_entries).
/// - **Values**: a single byte string per key.
///
/// # Invariants
///
/// - `append_entries` preserves insertion order
/// - `read_and_clear_entries` returns everything appended since the last
///   clear and leaves the list empty, as one atomic step
/// - `replace_entries` swaps the whole list in one atomic step; on error the
///   previous list is left intact
/// - Mutations are durable once the call returns (for persistent stores)
/// - Stores must be `Send + Sync` for concurrent access
///
/// # Implementors
///
/// - [`super::InMemoryStore`] - For testing
/// - [`super::FileStore`] - For persistent storage
pub trait KeyValueStore: Send + Sync {
    /// Appends values to the entry list stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    fn append_entries(&self, key: &str, values: Vec<Vec<u8>>) -> StorageResult<()>;

    /// Returns every entry stored under `key` and clears the list.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    fn read_and_clear_entries(&self, key: &str) -> StorageResult<Vec<Vec<u8>>>;

    /// Replaces the entry list stored under `key` with `values`.
    ///
    /// An empty `values` removes the list.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written. The previous list is
    /// then unchanged.
    fn replace_entries(&self, key: &str, values: Vec<Vec<u8>>) -> StorageResult<()>;

    /// Returns every entry stored under `key` without clearing it.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn peek_entries(&self, key: &str) -> StorageResult<Vec<Vec<u8>>>;

    /// Returns the keys of all non-empty entry lists, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn entry_keys(&self) -> StorageResult<Vec<String>>;

    /// Reads the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn get_value(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Replaces the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    fn set_value(&self, key: &str, value: Vec<u8>) -> StorageResult<()>;

    /// Removes the value and the entry list stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    fn remove(&self, key: &str) -> StorageResult<()>;

    /// Reads a signed 64-bit value stored with [`set_long`](Self::set_long).
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidValue`] if the stored value is not
    /// exactly eight bytes long.
    fn get_long(&self, key: &str) -> StorageResult<Option<i64>> {
        match self.get_value(key)? {
            None => Ok(None),
            Some(bytes) => {
                let raw: [u8; 8] =
                    bytes
                        .as_slice()
                        .try_into()
                        .map_err(|_| StorageError::InvalidValue {
                            key: key.to_string(),
                            len: bytes.len(),
                        })?;
                Ok(Some(i64::from_le_bytes(raw)))
            }
        }
    }

    /// Stores a signed 64-bit value.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be written.
    fn set_long(&self, key: &str, value: i64) -> StorageResult<()> {
        self.set_value(key, value.to_le_bytes().to_vec())
    }
}
