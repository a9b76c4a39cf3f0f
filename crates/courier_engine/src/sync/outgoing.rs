//! Outgoing (mobile-originated) message sends.

use super::{notify, InstallationState, ListenerSlot, ResultListener, SyncContext};
use crate::clock::duration_millis;
use crate::error::{SyncError, SyncResult};
use crate::model::{MessageStatus, MoMessage};
use crate::outbox::{Outbox, OUTGOING_OUTBOX_KEY};
use crate::policy::RetryPolicy;
use crate::runner::RetryableTask;
use crate::throttle::SyncThrottle;
use crate::transport::{MoMessagesRequest, MoMessagesResponse};
use std::sync::Arc;

const THROTTLE_KEY: &str = "last_sync.mo_messages";

/// Sends outgoing messages, either directly for a waiting caller or through
/// the durable outbox in the background.
pub struct MoMessageSynchronizer {
    ctx: SyncContext,
    state: Arc<InstallationState>,
    outbox: Arc<Outbox<MoMessage>>,
    throttle: Arc<SyncThrottle>,
}

impl std::fmt::Debug for MoMessageSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MoMessageSynchronizer")
            .field("outbox", &self.outbox)
            .field("throttle", &self.throttle)
            .finish()
    }
}

impl MoMessageSynchronizer {
    /// Creates a synchronizer reading the registration id from `state`.
    pub fn new(ctx: SyncContext, state: Arc<InstallationState>) -> Self {
        let outbox = Arc::new(Outbox::new(
            Arc::clone(&ctx.store),
            OUTGOING_OUTBOX_KEY,
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

    /// The queue of unsent messages.
    pub fn outbox(&self) -> &Outbox<MoMessage> {
        &self.outbox
    }

    /// Sends `messages` now, for a caller waiting on the result.
    ///
    /// Ignores the throttle window. Uses the foreground policy unless
    /// `policy` is given. A terminal failure marks every message
    /// [`MessageStatus::Failed`] and the messages are not queued.
    ///
    /// While another send or sync of this synchronizer is in flight, the
    /// messages go to the outbox instead and the listener receives them as
    /// [`MessageStatus::Pending`].
    pub fn send(
        &self,
        messages: Vec<MoMessage>,
        policy: Option<RetryPolicy>,
        listener: Option<ResultListener<Vec<MoMessage>>>,
    ) {
        let messages = self.discard_expired(messages);
        if messages.is_empty() {
            notify(listener, Ok(Vec::new()));
            return;
        }

        let Some(registration_id) = self.state.registration_id() else {
            notify(listener, Err(SyncError::NoValidRegistration));
            return;
        };

        if !self.throttle.try_begin(false) {
            self.defer(messages, listener);
            return;
        }

        let task = Arc::new(MoSendTask {
            ctx: self.ctx.clone(),
            registration_id,
            throttle: Arc::clone(&self.throttle),
            outbox: None,
            listener: ListenerSlot::new(listener),
        });
        let policy = policy.unwrap_or_else(|| self.ctx.config.foreground_policy.clone());
        self.ctx.runner.execute(task, messages, policy);
    }

    /// Queues `messages` in the outbox and triggers a background sync.
    ///
    /// # Errors
    ///
    /// Returns an error if the outbox cannot be written.
    pub fn send_in_background(&self, messages: Vec<MoMessage>) -> SyncResult<()> {
        self.outbox.enqueue(messages)?;
        self.sync(None);
        Ok(())
    }

    /// Sends everything waiting in the outbox under the background policy.
    pub fn sync(&self, listener: Option<ResultListener<Vec<MoMessage>>>) {
        if !self.throttle.try_begin(true) {
            notify(listener, Ok(Vec::new()));
            return;
        }

        let Some(registration_id) = self.state.registration_id() else {
            self.throttle.abort();
            tracing::debug!("outgoing messages held until registration");
            notify(listener, Err(SyncError::NoValidRegistration));
            return;
        };

        let messages = match self.outbox.dequeue_all() {
            Ok(messages) => self.discard_expired(messages),
            Err(e) => {
                self.throttle.abort();
                self.ctx.broadcaster.error(&e);
                notify(listener, Err(e));
                return;
            }
        };
        if messages.is_empty() {
            self.throttle.abort();
            notify(listener, Ok(Vec::new()));
            return;
        }

        let task = Arc::new(MoSendTask {
            ctx: self.ctx.clone(),
            registration_id,
            throttle: Arc::clone(&self.throttle),
            outbox: Some(Arc::clone(&self.outbox)),
            listener: ListenerSlot::new(listener),
        });
        self.ctx
            .runner
            .execute(task, messages, self.ctx.config.background_policy.clone());
    }

    fn defer(
        &self,
        messages: Vec<MoMessage>,
        listener: Option<ResultListener<Vec<MoMessage>>>,
    ) {
        tracing::debug!(count = messages.len(), "send in flight, queueing messages");
        let pending: Vec<MoMessage> = messages
            .into_iter()
            .map(|mut message| {
                message.status = MessageStatus::Pending;
                message
            })
            .collect();
        match self.outbox.enqueue(pending.clone()) {
            Ok(()) => notify(listener, Ok(pending)),
            Err(e) => {
                self.ctx.broadcaster.error(&e);
                notify(listener, Err(e));
            }
        }
    }

    fn discard_expired(&self, messages: Vec<MoMessage>) -> Vec<MoMessage> {
        let now = self.ctx.clock.now_millis();
        let lifetime = duration_millis(self.ctx.config.outbox_lifetime);
        messages
            .into_iter()
            .filter(|message| {
                let expired = now.saturating_sub(message.created_at) > lifetime;
                if expired {
                    tracing::warn!(message_id = %message.message_id, "discarding expired message");
                }
                !expired
            })
            .collect()
    }
}

struct MoSendTask {
    ctx: SyncContext,
    registration_id: String,
    throttle: Arc<SyncThrottle>,
    /// Set for background sends; failed messages go back here.
    outbox: Option<Arc<Outbox<MoMessage>>>,
    listener: ListenerSlot<Vec<MoMessage>>,
}

impl MoSendTask {
    /// Returns the messages to the outbox, or hands them back when there is
    /// no outbox to return them to.
    fn restore(&self, messages: Vec<MoMessage>) -> Option<Vec<MoMessage>> {
        let outbox = match &self.outbox {
            Some(outbox) => outbox,
            None => return Some(messages),
        };
        if let Err(e) = outbox.enqueue(messages) {
            tracing::error!(error = %e, "failed to restore outgoing messages");
        }
        None
    }
}

/// Applies per-message results. Messages the backend did not mention are
/// marked failed.
fn apply_results(messages: Vec<MoMessage>, response: &MoMessagesResponse) -> Vec<MoMessage> {
    messages
        .into_iter()
        .map(|mut message| {
            message.status = response
                .results
                .iter()
                .find(|result| result.message_id == message.message_id)
                .map_or(MessageStatus::Failed, |result| result.status);
            message
        })
        .collect()
}

impl RetryableTask for MoSendTask {
    type Item = MoMessage;
    type Output = MoMessagesResponse;

    fn run(&self, messages: &[MoMessage]) -> SyncResult<MoMessagesResponse> {
        let response = self.ctx.backend.send_messages(&MoMessagesRequest {
            registration_id: self.registration_id.clone(),
            messages: messages.to_vec(),
        })?;
        Ok(response)
    }

    fn after(&self, messages: Vec<MoMessage>, response: MoMessagesResponse) {
        self.throttle.finish();
        let sent = apply_results(messages, &response);
        tracing::info!(count = sent.len(), "outgoing messages sent");
        self.ctx.broadcaster.messages_sent(&sent);
        self.listener.fire(Ok(sent));
    }

    fn error(&self, messages: Vec<MoMessage>, error: SyncError) {
        let unsent = self.restore(messages);
        self.throttle.finish();
        if let Some(unsent) = unsent {
            let failed: Vec<MoMessage> = unsent
                .into_iter()
                .map(|mut message| {
                    message.status = MessageStatus::Failed;
                    message
                })
                .collect();
            self.ctx.broadcaster.messages_sent(&failed);
        }
        self.ctx.broadcaster.error(&error);
        self.listener.fire(Err(error));
    }

    fn cancelled(&self, messages: Vec<MoMessage>) {
        self.restore(messages);
        self.throttle.abort();
        self.listener.fire(Err(SyncError::Cancelled));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::BroadcastEvent;
    use crate::error::ErrorKind;
    use crate::sync::testing::{harness, listener, Harness, T0};
    use crate::transport::{BackendCall, MoMessageResult, TransportError};
    use std::time::Duration;

    const HOUR: Duration = Duration::from_secs(3600);

    fn synchronizer(h: &Harness) -> MoMessageSynchronizer {
        let state = Arc::new(InstallationState::load(h.store()).unwrap());
        state.set_registration_id("reg-1").unwrap();
        MoMessageSynchronizer::new(h.ctx.clone(), state)
    }

    fn sent_ids(call: &BackendCall) -> Vec<String> {
        match call {
            BackendCall::SendMessages(request) => request
                .messages
                .iter()
                .map(|m| m.message_id.clone())
                .collect(),
            other => panic!("unexpected call {other:?}"),
        }
    }

    #[test]
    fn missing_results_mark_message_failed() {
        let response = MoMessagesResponse {
            results: vec![MoMessageResult {
                message_id: "a".into(),
                status: MessageStatus::Sent,
                status_message: None,
            }],
        };
        let out = apply_results(
            vec![MoMessage::new("a", "x", 0), MoMessage::new("b", "y", 0)],
            &response,
        );
        assert_eq!(out[0].status, MessageStatus::Sent);
        assert_eq!(out[1].status, MessageStatus::Failed);
    }

    #[tokio::test]
    async fn foreground_send_reports_statuses() {
        let h = harness();
        let sync = synchronizer(&h);
        h.backend.reject_message("m2");

        let (done, result) = listener();
        sync.send(
            vec![MoMessage::new("m1", "hi", T0), MoMessage::new("m2", "yo", T0)],
            None,
            done,
        );
        let sent = result.await.unwrap().unwrap();

        assert_eq!(sent[0].status, MessageStatus::Sent);
        assert_eq!(sent[1].status, MessageStatus::Failed);
        assert!(matches!(
            h.broadcaster.events().last(),
            Some(BroadcastEvent::MessagesSent(messages)) if messages.len() == 2
        ));
    }

    #[tokio::test]
    async fn foreground_failure_is_not_queued() {
        let h = harness();
        let sync = synchronizer(&h);
        h.backend
            .fail_next(TransportError::backend(500, "5xx", "down"));

        let (done, result) = listener();
        sync.send(vec![MoMessage::new("m1", "hi", T0)], None, done);
        let err = result.await.unwrap().unwrap_err();

        assert_eq!(err.kind(), ErrorKind::TransientBackend);
        assert_eq!(h.backend.call_count(), 1);
        assert!(sync.outbox().is_empty().unwrap());
        assert_eq!(h.broadcaster.error_kinds(), vec![ErrorKind::TransientBackend]);
        assert!(h.broadcaster.events().iter().any(|event| matches!(
            event,
            BroadcastEvent::MessagesSent(messages)
                if messages.len() == 1 && messages[0].status == MessageStatus::Failed
        )));
    }

    #[tokio::test]
    async fn foreground_send_waits_out_background_sync() {
        let h = harness();
        let sync = synchronizer(&h);
        h.backend.set_latency(Duration::from_millis(200));
        sync.outbox()
            .enqueue(vec![MoMessage::new("m1", "a", T0)])
            .unwrap();

        let (done, background) = listener();
        sync.sync(done);
        let (done, foreground) = listener();
        sync.send(vec![MoMessage::new("m2", "b", T0)], None, done);

        let deferred = foreground.await.unwrap().unwrap();
        assert_eq!(deferred.len(), 1);
        assert_eq!(deferred[0].status, MessageStatus::Pending);

        let sent = background.await.unwrap().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].message_id, "m1");
        assert_eq!(h.backend.call_count(), 1);
        assert_eq!(sent_ids(&h.backend.calls()[0]), vec!["m1"]);

        let queued = sync.outbox().peek_all().unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].item.message_id, "m2");

        h.backend.set_latency(Duration::ZERO);
        let (done, next) = listener();
        sync.send(vec![MoMessage::new("m3", "c", T0)], None, done);
        assert_eq!(next.await.unwrap().unwrap()[0].status, MessageStatus::Sent);
        assert_eq!(h.backend.call_count(), 2);
    }

    #[tokio::test]
    async fn expired_message_is_never_sent() {
        let h = harness();
        let sync = synchronizer(&h);
        let stale = T0 - duration_millis(49 * HOUR);

        let (done, result) = listener();
        sync.send(
            vec![MoMessage::new("old", "x", stale), MoMessage::new("new", "y", T0)],
            None,
            done,
        );
        let sent = result.await.unwrap().unwrap();

        assert_eq!(sent.len(), 1);
        assert_eq!(sent_ids(&h.backend.calls()[0]), vec!["new"]);
    }

    #[tokio::test]
    async fn background_sync_drains_outbox() {
        let h = harness();
        let sync = synchronizer(&h);
        sync.outbox()
            .enqueue(vec![MoMessage::new("m1", "a", T0), MoMessage::new("m2", "b", T0)])
            .unwrap();

        let (done, result) = listener();
        sync.sync(done);
        let sent = result.await.unwrap().unwrap();

        assert_eq!(sent.len(), 2);
        assert!(sync.outbox().is_empty().unwrap());
        assert_eq!(h.backend.call_count(), 1);
    }

    #[tokio::test]
    async fn background_terminal_failure_restores_outbox() {
        let h = harness();
        let sync = synchronizer(&h);
        sync.outbox()
            .enqueue(vec![MoMessage::new("m1", "a", T0)])
            .unwrap();
        h.backend.fail_next(TransportError::connection("offline"));

        let (done, result) = listener();
        sync.sync(done);
        let err = result.await.unwrap().unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Unknown);
        assert_eq!(sync.outbox().len().unwrap(), 1);
    }

    #[tokio::test]
    async fn send_in_background_queues_and_syncs() {
        let (h, mut calls) = crate::sync::testing::observed_harness();
        let sync = synchronizer(&h);

        sync.send_in_background(vec![MoMessage::new("m1", "a", T0)])
            .unwrap();

        let call = calls.recv().await.unwrap();
        assert_eq!(sent_ids(&call), vec!["m1"]);
    }

    #[tokio::test]
    async fn missing_registration_keeps_outbox() {
        let h = harness();
        let state = Arc::new(InstallationState::load(h.store()).unwrap());
        let sync = MoMessageSynchronizer::new(h.ctx.clone(), state);
        sync.outbox()
            .enqueue(vec![MoMessage::new("m1", "a", T0)])
            .unwrap();

        let (done, result) = listener();
        sync.sync(done);

        assert_eq!(
            result.await.unwrap().unwrap_err().kind(),
            ErrorKind::NoValidRegistration
        );
        assert_eq!(sync.outbox().len().unwrap(), 1);
    }
}
