//! Durable outbox of undelivered work items.
//!
//! Items are stored as CBOR-encoded [`OutboxEntry`] records in a
//! [`KeyValueStore`] entry list. Every read-modify-write runs under one
//! mutex, so concurrent enqueues and drains never interleave. Rewrites go
//! through [`KeyValueStore::replace_entries`], so a failed write leaves the
//! queued entries where they were.

use crate::clock::{duration_millis, Clock};
use crate::error::{SyncError, SyncResult};
use courier_storage::KeyValueStore;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

/// Store key of the outgoing message outbox.
pub const OUTGOING_OUTBOX_KEY: &str = "outbox.mo_messages";
/// Store key of the delivery report outbox.
pub const DELIVERY_OUTBOX_KEY: &str = "outbox.delivery_reports";

/// A work item that can wait in an [`Outbox`].
pub trait OutboxItem {
    /// Unique id. Re-enqueueing an item with the same id replaces it.
    fn id(&self) -> &str;

    /// When the item was created, epoch milliseconds. Expiry is measured
    /// from here.
    fn received_at(&self) -> i64;
}

/// Persisted form of an outbox item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry<T> {
    /// The queued item.
    pub item: T,
    /// When the item was (last) enqueued, epoch milliseconds.
    pub enqueued_at: i64,
}

/// Encodes an entry as CBOR.
pub fn encode_entry<T: Serialize>(entry: &OutboxEntry<T>) -> SyncResult<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(entry, &mut buf).map_err(|e| SyncError::Codec(e.to_string()))?;
    Ok(buf)
}

/// Decodes an entry from CBOR.
pub fn decode_entry<T: DeserializeOwned>(bytes: &[u8]) -> SyncResult<OutboxEntry<T>> {
    ciborium::from_reader(bytes).map_err(|e| SyncError::Codec(e.to_string()))
}

/// A persistent, deduplicating queue of work items with a maximum lifetime.
pub struct Outbox<T> {
    store: Arc<dyn KeyValueStore>,
    key: String,
    lifetime: Duration,
    clock: Arc<dyn Clock>,
    guard: Mutex<()>,
    _item: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for Outbox<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbox")
            .field("key", &self.key)
            .field("lifetime", &self.lifetime)
            .finish()
    }
}

impl<T> Outbox<T>
where
    T: OutboxItem + Serialize + DeserializeOwned,
{
    /// Creates an outbox over the entry list `key` of `store`.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        key: impl Into<String>,
        lifetime: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            key: key.into(),
            lifetime,
            clock,
            guard: Mutex::new(()),
            _item: PhantomData,
        }
    }

    /// The store key this outbox writes to.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Adds items, replacing any queued item with the same id.
    ///
    /// Expired items, both incoming and already queued, are dropped.
    pub fn enqueue(&self, items: Vec<T>) -> SyncResult<()> {
        let _guard = self.guard.lock();
        let now = self.clock.now_millis();

        let mut fresh: Vec<OutboxEntry<T>> = Vec::with_capacity(items.len());
        for item in items {
            if self.is_expired(&item, now) {
                tracing::warn!(key = %self.key, id = item.id(), "dropping expired item on enqueue");
                continue;
            }
            fresh.retain(|entry| entry.item.id() != item.id());
            fresh.push(OutboxEntry {
                item,
                enqueued_at: now,
            });
        }

        let mut merged = self.decode_live(self.store.peek_entries(&self.key)?, now);
        merged.retain(|entry| !fresh.iter().any(|f| f.item.id() == entry.item.id()));
        merged.extend(fresh);

        self.write_back(&merged)
    }

    /// Removes and returns every queued item that has not expired.
    pub fn dequeue_all(&self) -> SyncResult<Vec<T>> {
        let _guard = self.guard.lock();
        let now = self.clock.now_millis();
        let entries = self.decode_live(self.store.read_and_clear_entries(&self.key)?, now);
        Ok(entries.into_iter().map(|entry| entry.item).collect())
    }

    /// Returns every queued entry without removing anything.
    pub fn peek_all(&self) -> SyncResult<Vec<OutboxEntry<T>>> {
        let _guard = self.guard.lock();
        Ok(self
            .store
            .peek_entries(&self.key)?
            .iter()
            .filter_map(|bytes| self.decode_or_skip(bytes))
            .collect())
    }

    /// Drops expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> SyncResult<usize> {
        let _guard = self.guard.lock();
        let now = self.clock.now_millis();
        let raw = self.store.peek_entries(&self.key)?;
        let total = raw.len();
        let live = self.decode_live(raw, now);
        let removed = total - live.len();
        self.write_back(&live)?;
        if removed > 0 {
            tracing::info!(key = %self.key, removed, "purged expired outbox entries");
        }
        Ok(removed)
    }

    /// Number of queued entries, including any not yet purged.
    pub fn len(&self) -> SyncResult<usize> {
        let _guard = self.guard.lock();
        Ok(self.store.peek_entries(&self.key)?.len())
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> SyncResult<bool> {
        Ok(self.len()? == 0)
    }

    fn is_expired(&self, item: &T, now: i64) -> bool {
        now.saturating_sub(item.received_at()) > duration_millis(self.lifetime)
    }

    fn decode_or_skip(&self, bytes: &[u8]) -> Option<OutboxEntry<T>> {
        match decode_entry(bytes) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "skipping undecodable outbox entry");
                None
            }
        }
    }

    fn decode_live(&self, raw: Vec<Vec<u8>>, now: i64) -> Vec<OutboxEntry<T>> {
        raw.iter()
            .filter_map(|bytes| self.decode_or_skip(bytes))
            .filter(|entry| {
                let expired = self.is_expired(&entry.item, now);
                if expired {
                    tracing::warn!(key = %self.key, id = entry.item.id(), "dropping expired outbox entry");
                }
                !expired
            })
            .collect()
    }

    fn write_back(&self, entries: &[OutboxEntry<T>]) -> SyncResult<()> {
        let encoded = entries
            .iter()
            .map(encode_entry)
            .collect::<SyncResult<Vec<_>>>()?;
        self.store.replace_entries(&self.key, encoded)?;
        Ok(())
    }
}
