//! Per-synchronizer throttle.

use crate::clock::{duration_millis, Clock};
use courier_storage::KeyValueStore;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
struct ThrottleState {
    last_sync_millis: i64,
    in_progress: bool,
}

/// Suppresses a sync that starts within `window` of the previous one or
/// while another is still in flight.
///
/// The last-sync timestamp is persisted, so the window also holds across a
/// restart.
pub struct SyncThrottle {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    key: String,
    window: Duration,
    state: Mutex<ThrottleState>,
}

impl std::fmt::Debug for SyncThrottle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SyncThrottle")
            .field("key", &self.key)
            .field("window", &self.window)
            .field("last_sync_millis", &state.last_sync_millis)
            .field("in_progress", &state.in_progress)
            .finish()
    }
}

impl SyncThrottle {
    /// Creates a throttle, loading the last-sync time stored under `key`.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        key: impl Into<String>,
        window: Duration,
    ) -> Self {
        let key = key.into();
        let last_sync_millis = match store.get_long(&key) {
            Ok(value) => value.unwrap_or(0),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "unreadable last-sync time, starting fresh");
                0
            }
        };
        Self {
            store,
            clock,
            key,
            window,
            state: Mutex::new(ThrottleState {
                last_sync_millis,
                in_progress: false,
            }),
        }
    }

    /// Tries to start a sync. Returns false if it should be skipped.
    ///
    /// With `respect_window` false only the in-flight check applies.
    pub fn try_begin(&self, respect_window: bool) -> bool {
        let now = self.clock.now_millis();
        let mut state = self.state.lock();

        if state.in_progress {
            tracing::debug!(key = %self.key, "sync already in progress, skipping");
            return false;
        }
        if respect_window
            && now.saturating_sub(state.last_sync_millis) < duration_millis(self.window)
        {
            tracing::debug!(key = %self.key, "sync throttled");
            return false;
        }

        state.in_progress = true;
        true
    }

    /// Marks the current sync as finished and records its time.
    pub fn finish(&self) {
        let now = self.clock.now_millis();
        {
            let mut state = self.state.lock();
            state.in_progress = false;
            state.last_sync_millis = now;
        }
        if let Err(e) = self.store.set_long(&self.key, now) {
            tracing::warn!(key = %self.key, error = %e, "failed to persist last-sync time");
        }
    }

    /// Ends the current sync without recording it, when no call was made.
    pub fn abort(&self) {
        self.state.lock().in_progress = false;
    }

    /// Returns true while a sync is in flight.
    pub fn is_in_progress(&self) -> bool {
        self.state.lock().in_progress
    }

    /// Epoch milliseconds of the last finished sync, or 0.
    pub fn last_sync_millis(&self) -> i64 {
        self.state.lock().last_sync_millis
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use courier_storage::InMemoryStore;

    const T0: i64 = 1_700_000_000_000;

    fn throttle() -> (SyncThrottle, Arc<ManualClock>, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(T0));
        let throttle = SyncThrottle::new(
            Arc::clone(&store) as Arc<dyn KeyValueStore>,
            Arc::clone(&clock) as Arc<dyn Clock>,
            "last_sync.test",
            Duration::from_secs(1),
        );
        (throttle, clock, store)
    }

    #[test]
    fn in_flight_sync_blocks_second() {
        let (throttle, _, _) = throttle();
        assert!(throttle.try_begin(true));
        assert!(!throttle.try_begin(true));
        assert!(!throttle.try_begin(false));
        assert!(throttle.is_in_progress());
    }

    #[test]
    fn window_blocks_until_elapsed() {
        let (throttle, clock, _) = throttle();
        assert!(throttle.try_begin(true));
        throttle.finish();

        clock.advance(Duration::from_millis(500));
        assert!(!throttle.try_begin(true));

        clock.advance(Duration::from_millis(500));
        assert!(throttle.try_begin(true));
    }

    #[test]
    fn foreground_ignores_window() {
        let (throttle, _, _) = throttle();
        assert!(throttle.try_begin(true));
        throttle.finish();
        assert!(throttle.try_begin(false));
    }

    #[test]
    fn abort_does_not_start_window() {
        let (throttle, _, store) = throttle();
        assert!(throttle.try_begin(true));
        throttle.abort();
        assert!(throttle.try_begin(true));
        assert_eq!(store.get_long("last_sync.test").unwrap(), None);
    }

    #[test]
    fn last_sync_is_persisted() {
        let (throttle, clock, store) = throttle();
        assert!(throttle.try_begin(true));
        throttle.finish();
        assert_eq!(store.get_long("last_sync.test").unwrap(), Some(T0));

        let reloaded = SyncThrottle::new(
            store as Arc<dyn KeyValueStore>,
            clock as Arc<dyn Clock>,
            "last_sync.test",
            Duration::from_secs(1),
        );
        assert_eq!(reloaded.last_sync_millis(), T0);
        assert!(!reloaded.try_begin(true));
    }
}
