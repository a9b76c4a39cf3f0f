//! File-based key-value store for persistent storage.
//!
//! A store occupies one directory:
//!
//! ```text
//! <store_path>/
//! ├─ LOCK          # Advisory lock for single-process access
//! ├─ STORE         # Current snapshot (magic + version + CBOR)
//! └─ STORE.tmp     # Scratch file for atomic snapshot writes
//! ```

use crate::error::{StorageError, StorageResult};
use crate::memory::StoreState;
use crate::store::KeyValueStore;
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const STORE_FILE: &str = "STORE";
const STORE_TEMP: &str = "STORE.tmp";

const MAGIC: &[u8; 4] = b"CRST";
const FORMAT_VERSION: u8 = 1;

/// A file-based key-value store.
///
/// Every mutation rewrites the snapshot with the write-then-rename pattern,
/// so a crash leaves either the old or the new snapshot on disk, never a
/// torn one.
///
/// # Thread Safety
///
/// The store is thread-safe. Across processes, the `LOCK` file allows a
/// single open instance per directory.
///
/// # Example
///
/// ```no_run
/// use courier_storage::{FileStore, KeyValueStore};
/// use std::path::Path;
///
/// let store = FileStore::open(Path::new("courier-data")).unwrap();
/// store.append_entries("outbox", vec![b"payload".to_vec()]).unwrap();
/// ```
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    state: Mutex<StoreState>,
    _lock_file: File,
}

impl FileStore {
    /// Opens or creates a store in the given directory.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory cannot be created
    /// - Another process holds the lock (returns [`StorageError::Locked`])
    /// - The snapshot exists but cannot be decoded
    pub fn open(path: &Path) -> StorageResult<Self> {
        fs::create_dir_all(path)?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked);
        }

        let state = load_snapshot(&path.join(STORE_FILE))?;

        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(state),
            _lock_file: lock_file,
        })
    }

    /// Returns the store directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Applies `f` to a copy of the state and persists it before publishing.
    ///
    /// If persisting fails, the in-memory state is left untouched.
    fn mutate<R>(&self, f: impl FnOnce(&mut StoreState) -> R) -> StorageResult<R> {
        let mut state = self.state.lock();
        let mut next = state.clone();
        let result = f(&mut next);
        if next != *state {
            self.persist(&next)?;
            *state = next;
        }
        Ok(result)
    }

    fn persist(&self, state: &StoreState) -> StorageResult<()> {
        let mut data = Vec::with_capacity(64);
        data.extend_from_slice(MAGIC);
        data.push(FORMAT_VERSION);
        ciborium::into_writer(state, &mut data)
            .map_err(|e| StorageError::Corrupted(format!("failed to encode snapshot: {e}")))?;

        let temp_path = self.path.join(STORE_TEMP);
        let mut file = File::create(&temp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, self.path.join(STORE_FILE))?;
        self.sync_directory()
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> StorageResult<()> {
        File::open(&self.path)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> StorageResult<()> {
        Ok(())
    }
}

fn load_snapshot(path: &Path) -> StorageResult<StoreState> {
    if !path.exists() {
        return Ok(StoreState::default());
    }

    let mut data = Vec::new();
    File::open(path)?.read_to_end(&mut data)?;
    if data.is_empty() {
        return Ok(StoreState::default());
    }

    let header_len = MAGIC.len() + 1;
    if data.len() < header_len || &data[..MAGIC.len()] != MAGIC {
        return Err(StorageError::Corrupted("bad snapshot magic".into()));
    }
    let version = data[MAGIC.len()];
    if version != FORMAT_VERSION {
        return Err(StorageError::Corrupted(format!(
            "unsupported snapshot version {version}"
        )));
    }

    ciborium::from_reader(&data[header_len..])
        .map_err(|e| StorageError::Corrupted(format!("failed to decode snapshot: {e}")))
}

impl KeyValueStore for FileStore {
    fn append_entries(&self, key: &str, values: Vec<Vec<u8>>) -> StorageResult<()> {
        self.mutate(|state| state.append(key, values))
    }

    fn read_and_clear_entries(&self, key: &str) -> StorageResult<Vec<Vec<u8>>> {
        self.mutate(|state| state.take(key))
    }

    fn replace_entries(&self, key: &str, values: Vec<Vec<u8>>) -> StorageResult<()> {
        self.mutate(|state| state.replace(key, values))
    }

    fn peek_entries(&self, key: &str) -> StorageResult<Vec<Vec<u8>>> {
        Ok(self.state.lock().peek(key))
    }

    fn entry_keys(&self) -> StorageResult<Vec<String>> {
        Ok(self.state.lock().keys())
    }

    fn get_value(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.state.lock().values.get(key).cloned())
    }

    fn set_value(&self, key: &str, value: Vec<u8>) -> StorageResult<()> {
        self.mutate(|state| {
            state.values.insert(key.to_string(), value);
        })
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        self.mutate(|state| state.remove(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_create_new() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");

        let store = FileStore::open(&path).unwrap();
        assert!(store.entry_keys().unwrap().is_empty());
        assert!(path.join(LOCK_FILE).exists());
        assert_eq!(store.path(), path);
    }

    #[test]
    fn file_persistence_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");

        {
            let store = FileStore::open(&path).unwrap();
            store
                .append_entries("outbox", vec![b"one".to_vec(), b"two".to_vec()])
                .unwrap();
            store.set_long("last_sync", 1234).unwrap();
        }

        {
            let store = FileStore::open(&path).unwrap();
            assert_eq!(store.get_long("last_sync").unwrap(), Some(1234));
            assert_eq!(
                store.read_and_clear_entries("outbox").unwrap(),
                vec![b"one".to_vec(), b"two".to_vec()]
            );
        }

        {
            let store = FileStore::open(&path).unwrap();
            assert!(store.peek_entries("outbox").unwrap().is_empty());
        }
    }

    #[test]
    fn file_second_open_is_locked() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");

        let _first = FileStore::open(&path).unwrap();
        let second = FileStore::open(&path);
        assert!(matches!(second, Err(StorageError::Locked)));
    }

    #[test]
    fn file_corrupted_snapshot_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join(STORE_FILE), b"garbage").unwrap();

        let result = FileStore::open(&path);
        assert!(matches!(result, Err(StorageError::Corrupted(_))));
    }

    #[test]
    fn file_empty_snapshot_is_treated_as_new() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join(STORE_FILE), b"").unwrap();

        let store = FileStore::open(&path).unwrap();
        assert!(store.entry_keys().unwrap().is_empty());
    }

    #[test]
    fn file_remove_is_persisted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");

        {
            let store = FileStore::open(&path).unwrap();
            store.set_value("k", b"v".to_vec()).unwrap();
            store.remove("k").unwrap();
        }

        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.get_value("k").unwrap(), None);
    }

    #[test]
    fn file_replace_is_persisted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");

        {
            let store = FileStore::open(&path).unwrap();
            store
                .append_entries("outbox", vec![b"one".to_vec(), b"two".to_vec()])
                .unwrap();
            store.replace_entries("outbox", vec![b"three".to_vec()]).unwrap();
        }

        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.peek_entries("outbox").unwrap(), vec![b"three".to_vec()]);
    }

    #[test]
    fn file_no_temp_file_left_behind() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store");

        let store = FileStore::open(&path).unwrap();
        store.set_value("k", b"v".to_vec()).unwrap();
        assert!(path.join(STORE_FILE).exists());
        assert!(!path.join(STORE_TEMP).exists());
    }
}
