//! Synchronizers: throttled orchestration of remote calls.
//!
//! Each synchronizer builds a unit of work from local state, decides
//! whether a network call is needed, hands the work to the
//! [`RetryableTaskRunner`] and applies the outcome to local state. Entry
//! points never block; outcomes arrive through the [`Broadcaster`] and an
//! optional per-call [`ResultListener`].

mod installation;
mod messages;
mod outgoing;

pub use installation::{InstallationState, InstallationSynchronizer, INSTALLATION_KEY};
pub use messages::MessagesSynchronizer;
pub use outgoing::MoMessageSynchronizer;

use crate::broadcast::Broadcaster;
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::SyncResult;
use crate::policy::RetryPolicy;
use crate::runner::RetryableTaskRunner;
use crate::scheduler::Scheduler;
use crate::transport::BackendClient;
use courier_storage::KeyValueStore;
use parking_lot::Mutex;
use std::sync::Arc;

/// Per-call completion callback. Invoked exactly once.
pub type ResultListener<T> = Box<dyn FnOnce(SyncResult<T>) + Send + 'static>;

/// Who is waiting on a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Periodic or lifecycle-triggered reconciliation.
    Background,
    /// An explicit user action.
    Foreground,
}

impl SyncMode {
    pub(crate) fn respects_window(self) -> bool {
        matches!(self, SyncMode::Background)
    }
}

/// Collaborators shared by all synchronizers of one engine.
#[derive(Clone)]
pub struct SyncContext {
    pub(crate) backend: Arc<dyn BackendClient>,
    pub(crate) store: Arc<dyn KeyValueStore>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) broadcaster: Arc<dyn Broadcaster>,
    pub(crate) runner: RetryableTaskRunner,
    pub(crate) config: EngineConfig,
}

impl std::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncContext")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SyncContext {
    /// Bundles the collaborators, using the system clock.
    pub fn new(
        backend: Arc<dyn BackendClient>,
        store: Arc<dyn KeyValueStore>,
        broadcaster: Arc<dyn Broadcaster>,
        scheduler: Scheduler,
        config: EngineConfig,
    ) -> Self {
        Self {
            backend,
            store,
            clock: Arc::new(SystemClock),
            broadcaster,
            runner: RetryableTaskRunner::new(scheduler),
            config,
        }
    }

    /// Replaces the clock used for throttling and expiry.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn policy(&self, mode: SyncMode) -> RetryPolicy {
        match mode {
            SyncMode::Background => self.config.background_policy.clone(),
            SyncMode::Foreground => self.config.foreground_policy.clone(),
        }
    }
}

/// A listener slot that can be fired once from any hook.
pub(crate) struct ListenerSlot<T>(Mutex<Option<ResultListener<T>>>);

impl<T> ListenerSlot<T> {
    pub(crate) fn new(listener: Option<ResultListener<T>>) -> Self {
        Self(Mutex::new(listener))
    }

    pub(crate) fn fire(&self, result: SyncResult<T>) {
        let listener = self.0.lock().take();
        notify(listener, result);
    }
}

pub(crate) fn notify<T>(listener: Option<ResultListener<T>>, result: SyncResult<T>) {
    if let Some(listener) = listener {
        listener(result);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::broadcast::RecordingBroadcaster;
    use crate::clock::ManualClock;
    use crate::transport::{BackendCall, MockBackend};
    use courier_storage::InMemoryStore;
    use tokio::sync::{mpsc, oneshot};

    pub(crate) const T0: i64 = 1_700_000_000_000;

    pub(crate) struct Harness {
        pub(crate) backend: Arc<MockBackend>,
        pub(crate) store: Arc<InMemoryStore>,
        pub(crate) clock: Arc<ManualClock>,
        pub(crate) broadcaster: Arc<RecordingBroadcaster>,
        pub(crate) ctx: SyncContext,
    }

    impl Harness {
        pub(crate) fn store(&self) -> Arc<dyn KeyValueStore> {
            Arc::clone(&self.store) as Arc<dyn KeyValueStore>
        }
    }

    fn build(backend: MockBackend) -> Harness {
        let backend = Arc::new(backend);
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(T0));
        let broadcaster = Arc::new(RecordingBroadcaster::new());
        let ctx = SyncContext::new(
            Arc::clone(&backend) as Arc<dyn BackendClient>,
            Arc::clone(&store) as Arc<dyn KeyValueStore>,
            Arc::clone(&broadcaster) as Arc<dyn Broadcaster>,
            Scheduler::current(2),
            EngineConfig::default(),
        )
        .with_clock(Arc::clone(&clock) as Arc<dyn Clock>);
        Harness {
            backend,
            store,
            clock,
            broadcaster,
            ctx,
        }
    }

    pub(crate) fn harness() -> Harness {
        build(MockBackend::new())
    }

    pub(crate) fn observed_harness() -> (Harness, mpsc::UnboundedReceiver<BackendCall>) {
        let (backend, calls) = MockBackend::with_observer();
        (build(backend), calls)
    }

    pub(crate) fn listener<T: Send + 'static>(
    ) -> (Option<ResultListener<T>>, oneshot::Receiver<SyncResult<T>>) {
        let (tx, rx) = oneshot::channel();
        let listener: ResultListener<T> = Box::new(move |result| {
            let _ = tx.send(result);
        });
        (Some(listener), rx)
    }
}
