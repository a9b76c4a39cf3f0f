//! # Courier Storage
//!
//! Durable key-value store trait and implementations for Courier.
//!
//! The sync engine keeps two kinds of state that must survive a process
//! restart: lists of undelivered work items (the outbox) and small scalar
//! values (throttle timestamps, the local installation record). Stores treat
//! both as **opaque bytes** and never interpret them.
//!
//! ## Design Principles
//!
//! - Entry lists are append-only until they are read and cleared in one step
//! - Scalar values are replaced wholesale
//! - Must be `Send + Sync`; every method takes `&self` and locks internally
//! - The engine owns all encoding of the stored bytes
//!
//! ## Available Stores
//!
//! - [`InMemoryStore`] - For testing and ephemeral sessions
//! - [`FileStore`] - Persistent, single-process store in a directory
//!
//! ## Example
//!
//! ```rust
//! use courier_storage::{InMemoryStore, KeyValueStore};
//!
//! let store = InMemoryStore::new();
//! store.append_entries("outbox", vec![b"a".to_vec(), b"b".to_vec()]).unwrap();
//! assert_eq!(store.read_and_clear_entries("outbox").unwrap().len(), 2);
//! assert!(store.read_and_clear_entries("outbox").unwrap().is_empty());
//!
//! store.set_long("last_sync", 42).unwrap();
//! assert_eq!(store.get_long("last_sync").unwrap(), Some(42));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod file;
mod memory;
mod store;

pub use error::{StorageError, StorageResult};
pub use file::FileStore;
pub use memory::InMemoryStore;
pub use store::KeyValueStore;
