//! Engine facade: wiring, lifecycle triggers and the periodic loop.

use crate::batch::BatchReporter;
use crate::broadcast::{Broadcaster, NoopBroadcaster};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::{SyncError, SyncResult};
use crate::model::AttributeValue;
use crate::scheduler::Scheduler;
use crate::sync::{
    InstallationState, InstallationSynchronizer, MessagesSynchronizer, MoMessageSynchronizer,
    SyncContext,
};
use crate::transport::BackendClient;
use courier_storage::KeyValueStore;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Builder for [`SyncEngine`].
pub struct SyncEngineBuilder {
    backend: Arc<dyn BackendClient>,
    store: Arc<dyn KeyValueStore>,
    config: EngineConfig,
    broadcaster: Arc<dyn Broadcaster>,
    clock: Arc<dyn Clock>,
    handle: Option<Handle>,
}

impl SyncEngineBuilder {
    /// Sets the configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the outcome broadcaster.
    pub fn with_broadcaster(mut self, broadcaster: Arc<dyn Broadcaster>) -> Self {
        self.broadcaster = broadcaster;
        self
    }

    /// Sets the clock used for throttling and expiry.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Runs background work on `handle` instead of the current runtime.
    pub fn with_runtime(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    /// Loads local state and starts the scheduler.
    ///
    /// # Errors
    ///
    /// Returns an error if no runtime is available or the stored
    /// installation cannot be loaded.
    pub fn build(self) -> SyncResult<SyncEngine> {
        let handle = match self.handle {
            Some(handle) => handle,
            None => Handle::try_current().map_err(|e| SyncError::unknown(e.to_string()))?,
        };
        let state = Arc::new(InstallationState::load(Arc::clone(&self.store))?);
        let scheduler = Scheduler::new(handle, self.config.worker_threads);
        let user_data = BatchReporter::new(scheduler.clone(), self.config.batch_delay);

        let ctx = SyncContext::new(
            self.backend,
            self.store,
            self.broadcaster,
            scheduler.clone(),
            self.config,
        )
        .with_clock(self.clock);

        tracing::debug!(config = ?ctx.config(), "sync engine built");

        Ok(SyncEngine {
            installation: Arc::new(InstallationSynchronizer::new(
                ctx.clone(),
                Arc::clone(&state),
            )),
            messages: Arc::new(MessagesSynchronizer::new(ctx.clone(), Arc::clone(&state))),
            outgoing: Arc::new(MoMessageSynchronizer::new(ctx, state)),
            scheduler,
            user_data,
            periodic: Mutex::new(None),
            stop_periodic: Arc::new(Notify::new()),
        })
    }
}

/// The reliable delivery engine.
///
/// Owns the scheduler and the synchronizers. All entry points return
/// immediately; work runs on the scheduler.
///
/// # Example
///
/// ```rust,no_run
/// use courier_engine::{MockBackend, SyncEngine};
/// use courier_storage::InMemoryStore;
/// use std::sync::Arc;
///
/// # async fn run() -> courier_engine::SyncResult<()> {
/// let engine = SyncEngine::builder(Arc::new(MockBackend::new()), Arc::new(InMemoryStore::new()))
///     .build()?;
/// engine.installation().set_push_token("token")?;
/// engine.on_foreground();
/// engine.shutdown();
/// # Ok(())
/// # }
/// ```
pub struct SyncEngine {
    scheduler: Scheduler,
    installation: Arc<InstallationSynchronizer>,
    messages: Arc<MessagesSynchronizer>,
    outgoing: Arc<MoMessageSynchronizer>,
    user_data: BatchReporter,
    periodic: Mutex<Option<JoinHandle<()>>>,
    stop_periodic: Arc<Notify>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("scheduler", &self.scheduler)
            .field("installation", &self.installation)
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    /// Starts building an engine around a backend client and a store.
    pub fn builder(
        backend: Arc<dyn BackendClient>,
        store: Arc<dyn KeyValueStore>,
    ) -> SyncEngineBuilder {
        SyncEngineBuilder {
            backend,
            store,
            config: EngineConfig::default(),
            broadcaster: Arc::new(NoopBroadcaster),
            clock: Arc::new(SystemClock),
            handle: None,
        }
    }

    /// Installation registration and profile sync.
    pub fn installation(&self) -> &InstallationSynchronizer {
        &self.installation
    }

    /// Incoming message delivery reports.
    pub fn messages(&self) -> &MessagesSynchronizer {
        &self.messages
    }

    /// Outgoing message sends.
    pub fn outgoing(&self) -> &MoMessageSynchronizer {
        &self.outgoing
    }

    /// The app came to the foreground.
    pub fn on_foreground(&self) {
        tracing::debug!("foreground trigger");
        self.sync_all();
    }

    /// Network connectivity came back.
    pub fn on_connectivity_restored(&self) {
        tracing::debug!("connectivity trigger");
        self.sync_all();
    }

    /// Sets a custom attribute and reports it through the user data batch.
    ///
    /// # Errors
    ///
    /// Returns an error if the installation cannot be persisted.
    pub fn set_custom_attribute(
        &self,
        key: impl Into<String>,
        value: AttributeValue,
    ) -> SyncResult<()> {
        self.installation.set_custom_attribute(key, value)?;
        let installation = Arc::clone(&self.installation);
        self.user_data.put(move || installation.sync(None));
        Ok(())
    }

    /// Starts background reconciliation every `interval`.
    ///
    /// The first round runs immediately. Has no effect if a loop is already
    /// running.
    pub fn start_periodic(&self, interval: Duration) {
        let mut periodic = self.periodic.lock();
        if periodic.as_ref().is_some_and(|task| !task.is_finished()) {
            tracing::debug!("periodic sync already running");
            return;
        }

        let installation = Arc::clone(&self.installation);
        let messages = Arc::clone(&self.messages);
        let outgoing = Arc::clone(&self.outgoing);
        let stop = Arc::clone(&self.stop_periodic);

        *periodic = Some(self.scheduler.handle().spawn(async move {
            tracing::info!(interval_ms = interval.as_millis() as u64, "periodic sync started");
            let mut ticks = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = stop.notified() => break,
                    _ = ticks.tick() => {
                        installation.sync(None);
                        messages.sync(None);
                        outgoing.sync(None);
                    }
                }
            }

            tracing::info!("periodic sync stopped");
        }));
    }

    /// Stops the periodic loop and the scheduler.
    ///
    /// Work already queued still completes; new work is reported as
    /// cancelled.
    pub fn shutdown(&self) {
        if self.periodic.lock().take().is_some() {
            self.stop_periodic.notify_one();
        }
        self.scheduler.shutdown();
    }

    fn sync_all(&self) {
        self.installation.sync(None);
        self.messages.sync(None);
        self.outgoing.sync(None);
    }
}
