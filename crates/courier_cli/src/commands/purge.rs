//! Purge and clear command implementations.

use courier_engine::{
    Clock, DeliveryReport, MoMessage, Outbox, SystemClock, DELIVERY_OUTBOX_KEY,
    OUTGOING_OUTBOX_KEY,
};
use courier_storage::{FileStore, KeyValueStore};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Runs the purge command.
pub fn run(path: &Path, lifetime_hours: u64) -> Result<(), Box<dyn std::error::Error>> {
    let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(path)?);
    let lifetime = Duration::from_secs(lifetime_hours.saturating_mul(3600));

    let (outgoing, delivery) = purge(store, lifetime, Arc::new(SystemClock))?;
    println!("{OUTGOING_OUTBOX_KEY}: removed {outgoing} expired entries");
    println!("{DELIVERY_OUTBOX_KEY}: removed {delivery} expired entries");
    Ok(())
}

/// Drops expired entries from both outboxes.
pub fn purge(
    store: Arc<dyn KeyValueStore>,
    lifetime: Duration,
    clock: Arc<dyn Clock>,
) -> Result<(usize, usize), Box<dyn std::error::Error>> {
    let outgoing: Outbox<MoMessage> = Outbox::new(
        Arc::clone(&store),
        OUTGOING_OUTBOX_KEY,
        lifetime,
        Arc::clone(&clock),
    );
    let delivery: Outbox<DeliveryReport> =
        Outbox::new(store, DELIVERY_OUTBOX_KEY, lifetime, clock);

    Ok((outgoing.purge_expired()?, delivery.purge_expired()?))
}

/// Runs the clear command.
pub fn clear(path: &Path, key: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let store = FileStore::open(path)?;
    for cleared in clear_keys(&store, key)? {
        println!("Cleared {cleared}");
    }
    Ok(())
}

/// Empties the outbox `key`, or every outbox. Returns the keys cleared.
///
/// Only entry lists are touched; stored values such as the installation
/// record and last-sync times are kept.
pub fn clear_keys(
    store: &dyn KeyValueStore,
    key: Option<&str>,
) -> Result<Vec<String>, Box<dyn std::error::Error>> {
    let existing = store.entry_keys()?;
    let keys = match key {
        Some(key) if existing.iter().any(|k| k == key) => vec![key.to_string()],
        Some(key) => return Err(format!("No outbox entries under {key:?}").into()),
        None => existing,
    };
    for key in &keys {
        tracing::debug!(key = %key, "clearing");
        store.replace_entries(key, Vec::new())?;
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_engine::ManualClock;
    use courier_storage::InMemoryStore;

    const T0: i64 = 1_700_000_000_000;
    const HOUR_MS: i64 = 3_600_000;

    #[test]
    fn purge_removes_only_expired() {
        let store: Arc<dyn KeyValueStore> = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(T0));
        let outbox: Outbox<MoMessage> = Outbox::new(
            Arc::clone(&store),
            OUTGOING_OUTBOX_KEY,
            Duration::from_secs(100 * 3600),
            Arc::clone(&clock) as Arc<dyn Clock>,
        );
        outbox
            .enqueue(vec![
                MoMessage::new("old", "x", T0 - 60 * HOUR_MS),
                MoMessage::new("new", "y", T0),
            ])
            .unwrap();

        let (outgoing, delivery) =
            purge(Arc::clone(&store), Duration::from_secs(48 * 3600), clock).unwrap();
        assert_eq!((outgoing, delivery), (1, 0));
        assert_eq!(store.peek_entries(OUTGOING_OUTBOX_KEY).unwrap().len(), 1);
    }

    #[test]
    fn clear_all_or_one_key() {
        let store = InMemoryStore::new();
        store.append_entries("a", vec![vec![1]]).unwrap();
        store.append_entries("b", vec![vec![2]]).unwrap();

        assert_eq!(clear_keys(&store, Some("a")).unwrap(), vec!["a"]);
        assert_eq!(store.entry_keys().unwrap(), vec!["b"]);

        assert_eq!(clear_keys(&store, None).unwrap(), vec!["b"]);
        assert!(store.entry_keys().unwrap().is_empty());
    }

    #[test]
    fn clear_leaves_stored_values_alone() {
        let store = InMemoryStore::new();
        store
            .set_value(courier_engine::INSTALLATION_KEY, b"record".to_vec())
            .unwrap();
        store.set_long("last_sync.mo_messages", 42).unwrap();
        store
            .append_entries(OUTGOING_OUTBOX_KEY, vec![vec![1]])
            .unwrap();

        assert!(clear_keys(&store, Some(courier_engine::INSTALLATION_KEY)).is_err());
        assert_eq!(clear_keys(&store, None).unwrap(), vec![OUTGOING_OUTBOX_KEY]);

        assert_eq!(
            store.get_value(courier_engine::INSTALLATION_KEY).unwrap(),
            Some(b"record".to_vec())
        );
        assert_eq!(store.get_long("last_sync.mo_messages").unwrap(), Some(42));
    }
}
