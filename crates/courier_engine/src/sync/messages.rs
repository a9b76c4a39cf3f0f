//! Delivery acknowledgements for incoming messages.

use super::{notify, InstallationState, ListenerSlot, ResultListener, SyncContext};
use crate::error::{SyncError, SyncResult};
use crate::model::DeliveryReport;
use crate::outbox::{Outbox, DELIVERY_OUTBOX_KEY};
use crate::runner::RetryableTask;
use crate::throttle::SyncThrottle;
use crate::transport::MessagesSyncRequest;
use std::sync::Arc;

const THROTTLE_KEY: &str = "last_sync.messages";

/// Reports which incoming messages reached this device.
///
/// Reports wait in a durable outbox until a sync delivers them, so a report
/// made while offline or before registration is not lost.
pub struct MessagesSynchronizer {
    ctx: SyncContext,
    state: Arc<InstallationState>,
    outbox: Arc<Outbox<DeliveryReport>>,
    throttle: Arc<SyncThrottle>,
}

impl std::fmt::Debug for MessagesSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagesSynchronizer")
            .field("outbox", &self.outbox)
            .field("throttle", &self.throttle)
            .finish()
    }
}

impl MessagesSynchronizer {
    /// Creates a synchronizer reading the registration id from `state`.
    pub fn new(ctx: SyncContext, state: Arc<InstallationState>) -> Self {
        let outbox = Arc::new(Outbox::new(
            Arc::clone(&ctx.store),
            DELIVERY_OUTBOX_KEY,
            ctx.config.outbox_lifetime,
            Arc::clone(&ctx.clock),
        ));
        let throttle = Arc::new(SyncThrottle::new(
            Arc::clone(&ctx.store),
            Arc::clone(&ctx.clock),
            THROTTLE_KEY,
            ctx.config.throttle_window,
        ));
        Self {
            ctx,
            state,
            outbox,
            throttle,
        }
    }

    /// Queues delivery reports for the given message ids.
    ///
    /// # Errors
    ///
    /// Returns an error if the outbox cannot be written.
    pub fn report_delivery<I, S>(&self, message_ids: I) -> SyncResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let now = self.ctx.clock.now_millis();
        let reports = message_ids
            .into_iter()
            .map(|id| DeliveryReport::new(id, now))
            .collect();
        self.outbox.enqueue(reports)
    }

    /// The queue of unsent reports.
    pub fn outbox(&self) -> &Outbox<DeliveryReport> {
        &self.outbox
    }

    /// Sends every queued report. The listener receives the acknowledged ids.
    pub fn sync(&self, listener: Option<ResultListener<Vec<String>>>) {
        if !self.throttle.try_begin(true) {
            notify(listener, Ok(Vec::new()));
            return;
        }

        let Some(registration_id) = self.state.registration_id() else {
            self.throttle.abort();
            tracing::debug!("delivery reports held until registration");
            notify(listener, Err(SyncError::NoValidRegistration));
            return;
        };

        let reports = match self.outbox.dequeue_all() {
            Ok(reports) => reports,
            Err(e) => {
                self.throttle.abort();
                self.ctx.broadcaster.error(&e);
                notify(listener, Err(e));
                return;
            }
        };
        if reports.is_empty() {
            self.throttle.abort();
            notify(listener, Ok(Vec::new()));
            return;
        }

        let task = Arc::new(DeliveryReportTask {
            ctx: self.ctx.clone(),
            registration_id,
            outbox: Arc::clone(&self.outbox),
            throttle: Arc::clone(&self.throttle),
            listener: ListenerSlot::new(listener),
        });
        self.ctx
            .runner
            .execute(task, reports, self.ctx.config.background_policy.clone());
    }
}

struct DeliveryReportTask {
    ctx: SyncContext,
    registration_id: String,
    outbox: Arc<Outbox<DeliveryReport>>,
    throttle: Arc<SyncThrottle>,
    listener: ListenerSlot<Vec<String>>,
}

impl DeliveryReportTask {
    fn restore(&self, reports: Vec<DeliveryReport>) {
        if let Err(e) = self.outbox.enqueue(reports) {
            tracing::error!(error = %e, "failed to restore delivery reports");
        }
    }
}

impl RetryableTask for DeliveryReportTask {
    type Item = DeliveryReport;
    type Output = ();

    fn run(&self, reports: &[DeliveryReport]) -> SyncResult<()> {
        self.ctx.backend.sync_messages(&MessagesSyncRequest {
            registration_id: self.registration_id.clone(),
            delivered_message_ids: reports.iter().map(|r| r.message_id.clone()).collect(),
        })?;
        Ok(())
    }

    fn after(&self, reports: Vec<DeliveryReport>, _output: ()) {
        self.throttle.finish();
        let ids: Vec<String> = reports.into_iter().map(|r| r.message_id).collect();
        tracing::info!(count = ids.len(), "delivery reported");
        self.ctx.broadcaster.delivery_reported(&ids);
        self.listener.fire(Ok(ids));
    }

    fn error(&self, reports: Vec<DeliveryReport>, error: SyncError) {
        self.restore(reports);
        self.throttle.finish();
        self.ctx.broadcaster.error(&error);
        self.listener.fire(Err(error));
    }

    fn cancelled(&self, reports: Vec<DeliveryReport>) {
        self.restore(reports);
        self.throttle.abort();
        self.listener.fire(Err(SyncError::Cancelled));
    }
}
