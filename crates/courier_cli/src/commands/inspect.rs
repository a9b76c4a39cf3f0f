//! Inspect command implementation.

use courier_engine::{decode_entry, Installation, InstallationState};
use courier_storage::{FileStore, KeyValueStore};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

/// Store inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Store path.
    pub path: String,
    /// Local installation.
    pub installation: Installation,
    /// Per-outbox statistics.
    pub outboxes: Vec<OutboxStats>,
}

/// Statistics for a single outbox key.
#[derive(Debug, Serialize)]
pub struct OutboxStats {
    /// Store key.
    pub key: String,
    /// Number of stored entries.
    pub count: usize,
    /// Entries that could not be decoded.
    pub undecodable: usize,
    /// Oldest enqueue time, epoch milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_enqueued_at: Option<i64>,
    /// Decoded entries (if requested).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<serde_json::Value>>,
}

/// Runs the inspect command.
pub fn run(path: &Path, show_entries: bool, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No store found at {:?}", path).into());
    }

    let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(path)?);
    let result = inspect(path, store, show_entries)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

/// Collects the inspection result from an open store.
pub fn inspect(
    path: &Path,
    store: Arc<dyn KeyValueStore>,
    show_entries: bool,
) -> Result<InspectResult, Box<dyn std::error::Error>> {
    let mut outboxes = Vec::new();
    for key in store.entry_keys()? {
        outboxes.push(outbox_stats(store.as_ref(), &key, show_entries)?);
    }

    Ok(InspectResult {
        path: path.display().to_string(),
        installation: InstallationState::load(store)?.snapshot(),
        outboxes,
    })
}

fn outbox_stats(
    store: &dyn KeyValueStore,
    key: &str,
    show_entries: bool,
) -> Result<OutboxStats, Box<dyn std::error::Error>> {
    let raw = store.peek_entries(key)?;
    let mut stats = OutboxStats {
        key: key.to_string(),
        count: raw.len(),
        undecodable: 0,
        oldest_enqueued_at: None,
        entries: show_entries.then(Vec::new),
    };

    for bytes in &raw {
        match decode_entry::<serde_json::Value>(bytes) {
            Ok(entry) => {
                stats.oldest_enqueued_at = Some(
                    stats
                        .oldest_enqueued_at
                        .map_or(entry.enqueued_at, |oldest| oldest.min(entry.enqueued_at)),
                );
                if let Some(entries) = stats.entries.as_mut() {
                    entries.push(serde_json::json!({
                        "enqueued_at": entry.enqueued_at,
                        "item": entry.item,
                    }));
                }
            }
            Err(e) => {
                tracing::debug!(key, error = %e, "undecodable entry");
                stats.undecodable += 1;
            }
        }
    }

    Ok(stats)
}

fn print_text_output(result: &InspectResult) {
    println!("Courier Store: {}", result.path);
    println!();

    let installation = &result.installation;
    println!("Installation:");
    println!(
        "  Registration ID: {}",
        installation.registration_id.as_deref().unwrap_or("(none)")
    );
    println!(
        "  Push token:      {}",
        installation.push_token.as_deref().unwrap_or("(none)")
    );
    println!("  Primary device:  {}", installation.is_primary_device);
    println!(
        "  Attributes:      {}",
        installation.custom_attributes.len()
    );
    println!();

    if result.outboxes.is_empty() {
        println!("Outboxes: empty");
        return;
    }

    println!("Outboxes:");
    for outbox in &result.outboxes {
        print!("  {}: {} entries", outbox.key, outbox.count);
        if outbox.undecodable > 0 {
            print!(" ({} undecodable)", outbox.undecodable);
        }
        if let Some(oldest) = outbox.oldest_enqueued_at {
            print!(", oldest enqueued at {oldest}");
        }
        println!();

        if let Some(entries) = &outbox.entries {
            for entry in entries {
                println!("    {entry}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_engine::{DeliveryReport, OutboxEntry, DELIVERY_OUTBOX_KEY};
    use courier_storage::InMemoryStore;

    #[test]
    fn counts_entries_and_undecodable() {
        let store = Arc::new(InMemoryStore::new());
        let entry = OutboxEntry {
            item: DeliveryReport::new("m1", 10),
            enqueued_at: 20,
        };
        store
            .append_entries(
                DELIVERY_OUTBOX_KEY,
                vec![courier_engine::encode_entry(&entry).unwrap(), b"junk".to_vec()],
            )
            .unwrap();

        let result = inspect(Path::new("mem"), store, true).unwrap();
        let stats = &result.outboxes[0];
        assert_eq!(stats.key, DELIVERY_OUTBOX_KEY);
        assert_eq!(stats.count, 2);
        assert_eq!(stats.undecodable, 1);
        assert_eq!(stats.oldest_enqueued_at, Some(20));
        assert_eq!(
            stats.entries.as_ref().unwrap()[0]["item"]["message_id"],
            "m1"
        );
        assert!(result.installation.registration_id.is_none());
    }
}
