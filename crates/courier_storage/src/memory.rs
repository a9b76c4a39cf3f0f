//! In-memory key-value store for testing.

use crate::error::StorageResult;
use crate::store::KeyValueStore;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Contents of a store, shared by the in-memory and file implementations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct StoreState {
    pub(crate) entries: BTreeMap<String, Vec<Vec<u8>>>,
    pub(crate) values: BTreeMap<String, Vec<u8>>,
}

impl StoreState {
    pub(crate) fn append(&mut self, key: &str, values: Vec<Vec<u8>>) {
        if values.is_empty() {
            return;
        }
        self.entries.entry(key.to_string()).or_default().extend(values);
    }

    pub(crate) fn replace(&mut self, key: &str, values: Vec<Vec<u8>>) {
        if values.is_empty() {
            self.entries.remove(key);
        } else {
            self.entries.insert(key.to_string(), values);
        }
    }

    pub(crate) fn take(&mut self, key: &str) -> Vec<Vec<u8>> {
        self.entries.remove(key).unwrap_or_default()
    }

    pub(crate) fn peek(&self, key: &str) -> Vec<Vec<u8>> {
        self.entries.get(key).cloned().unwrap_or_default()
    }

    pub(crate) fn keys(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, list)| !list.is_empty())
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub(crate) fn remove(&mut self, key: &str) {
        self.entries.remove(key);
        self.values.remove(key);
    }
}

/// An in-memory key-value store.
///
/// This store keeps everything in memory and is suitable for:
/// - Unit tests
/// - Integration tests
/// - Sessions that don't need delivery across restarts
///
/// # Thread Safety
///
/// This store is thread-safe and can be shared across threads.
///
/// # Example
///
/// ```rust
/// use courier_storage::{InMemoryStore, KeyValueStore};
///
/// let store = InMemoryStore::new();
/// store.set_value("token", b"abc".to_vec()).unwrap();
/// assert_eq!(store.get_value("token").unwrap(), Some(b"abc".to_vec()));
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<StoreState>,
}

impl InMemoryStore {
    /// Creates a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of entries across all lists.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.state.read().entries.values().map(Vec::len).sum()
    }

    /// Clears all entries and values.
    pub fn clear(&self) {
        *self.state.write() = StoreState::default();
    }
}

impl KeyValueStore for InMemoryStore {
    fn append_entries(&self, key: &str, values: Vec<Vec<u8>>) -> StorageResult<()> {
        self.state.write().append(key, values);
        Ok(())
    }

    fn read_and_clear_entries(&self, key: &str) -> StorageResult<Vec<Vec<u8>>> {
        Ok(self.state.write().take(key))
    }

    fn replace_entries(&self, key: &str, values: Vec<Vec<u8>>) -> StorageResult<()> {
        self.state.write().replace(key, values);
        Ok(())
    }

    fn peek_entries(&self, key: &str) -> StorageResult<Vec<Vec<u8>>> {
        Ok(self.state.read().peek(key))
    }

    fn entry_keys(&self) -> StorageResult<Vec<String>> {
        Ok(self.state.read().keys())
    }

    fn get_value(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.state.read().values.get(key).cloned())
    }

    fn set_value(&self, key: &str, value: Vec<u8>) -> StorageResult<()> {
        self.state.write().values.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        self.state.write().remove(key);
        Ok(())
    }
}
