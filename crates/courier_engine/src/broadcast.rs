//! Outcome notifications.

use crate::error::{ErrorKind, SyncError};
use crate::model::{Installation, MoMessage};
use parking_lot::Mutex;

/// Receives sync outcomes. All methods default to doing nothing.
///
/// Called on the background pool; implementations must not block.
pub trait Broadcaster: Send + Sync {
    /// The local installation changed as a result of a sync.
    fn installation_updated(&self, _installation: &Installation) {}

    /// The backend assigned a registration id.
    fn registration_created(&self, _push_token: &str, _registration_id: &str) {}

    /// Outgoing messages were sent; statuses are final.
    fn messages_sent(&self, _messages: &[MoMessage]) {}

    /// Delivery of incoming messages was acknowledged.
    fn delivery_reported(&self, _message_ids: &[String]) {}

    /// A sync failed terminally.
    fn error(&self, _error: &SyncError) {}
}

/// A broadcaster that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBroadcaster;

impl Broadcaster for NoopBroadcaster {}

/// An event captured by [`RecordingBroadcaster`].
#[derive(Debug, Clone, PartialEq)]
pub enum BroadcastEvent {
    /// See [`Broadcaster::installation_updated`].
    InstallationUpdated(Installation),
    /// See [`Broadcaster::registration_created`].
    RegistrationCreated {
        /// Token that was registered.
        push_token: String,
        /// Assigned registration id.
        registration_id: String,
    },
    /// See [`Broadcaster::messages_sent`].
    MessagesSent(Vec<MoMessage>),
    /// See [`Broadcaster::delivery_reported`].
    DeliveryReported(Vec<String>),
    /// See [`Broadcaster::error`].
    Error {
        /// Failure class.
        kind: ErrorKind,
        /// Rendered error.
        message: String,
    },
}

/// A broadcaster that keeps every event, for tests.
#[derive(Debug, Default)]
pub struct RecordingBroadcaster {
    events: Mutex<Vec<BroadcastEvent>>,
}

impl RecordingBroadcaster {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the events recorded so far.
    pub fn events(&self) -> Vec<BroadcastEvent> {
        self.events.lock().clone()
    }

    /// Returns the kinds of recorded errors.
    pub fn error_kinds(&self) -> Vec<ErrorKind> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                BroadcastEvent::Error { kind, .. } => Some(*kind),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: BroadcastEvent) {
        self.events.lock().push(event);
    }
}

impl Broadcaster for RecordingBroadcaster {
    fn installation_updated(&self, installation: &Installation) {
        self.push(BroadcastEvent::InstallationUpdated(installation.clone()));
    }

    fn registration_created(&self, push_token: &str, registration_id: &str) {
        self.push(BroadcastEvent::RegistrationCreated {
            push_token: push_token.to_string(),
            registration_id: registration_id.to_string(),
        });
    }

    fn messages_sent(&self, messages: &[MoMessage]) {
        self.push(BroadcastEvent::MessagesSent(messages.to_vec()));
    }

    fn delivery_reported(&self, message_ids: &[String]) {
        self.push(BroadcastEvent::DeliveryReported(message_ids.to_vec()));
    }

    fn error(&self, error: &SyncError) {
        self.push(BroadcastEvent::Error {
            kind: error.kind(),
            message: error.to_string(),
        });
    }
}
