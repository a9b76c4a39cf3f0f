//! Backend client abstraction.

use crate::model::{InstallationPatch, MessageStatus, MoMessage};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::mpsc;

/// Raw failure reported by a backend client, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    /// HTTP status, if a response was received.
    pub status: Option<u16>,
    /// Backend error code from the response body, if any.
    pub code: Option<String>,
    /// Human-readable message.
    pub message: String,
}

impl TransportError {
    /// A structured backend error response.
    pub fn backend(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            code: Some(code.into()),
            message: message.into(),
        }
    }

    /// A failure with no response at all (connection refused, timeout...).
    pub fn connection(message: impl Into<String>) -> Self {
        Self {
            status: None,
            code: None,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.status, &self.code) {
            (Some(status), Some(code)) => write!(f, "{status} {code}: {}", self.message),
            (Some(status), None) => write!(f, "{status}: {}", self.message),
            _ => f.write_str(&self.message),
        }
    }
}

/// Result type for backend calls.
pub type TransportResult<T> = Result<T, TransportError>;

/// Request creating a new installation.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateInstallationRequest {
    /// Push token to register.
    pub push_token: String,
    /// Pending fields sent along with the registration.
    pub patch: InstallationPatch,
}

/// Response to a successful installation create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationResponse {
    /// Server-assigned registration id.
    pub registration_id: String,
}

/// Acknowledgement of delivered incoming messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagesSyncRequest {
    /// Registration id of this installation.
    pub registration_id: String,
    /// Ids of messages delivered to this device.
    pub delivered_message_ids: Vec<String>,
}

/// Batch of outgoing messages.
#[derive(Debug, Clone, PartialEq)]
pub struct MoMessagesRequest {
    /// Registration id of this installation.
    pub registration_id: String,
    /// Messages to send.
    pub messages: Vec<MoMessage>,
}

/// Per-message outcome of a send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoMessageResult {
    /// Message id.
    pub message_id: String,
    /// Whether the backend accepted the message.
    pub status: MessageStatus,
    /// Backend explanation for a rejection.
    pub status_message: Option<String>,
}

/// Response to a batch send.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MoMessagesResponse {
    /// One result per sent message.
    pub results: Vec<MoMessageResult>,
}

/// A backend client handles network communication with the server.
///
/// Calls are blocking; the engine always invokes them on its background
/// pool. Implementations return raw [`TransportError`]s and leave
/// classification to the engine.
pub trait BackendClient: Send + Sync {
    /// Registers a new installation.
    fn create_installation(
        &self,
        request: &CreateInstallationRequest,
    ) -> TransportResult<RegistrationResponse>;

    /// Applies a partial update to an existing installation.
    fn patch_installation(
        &self,
        registration_id: &str,
        patch: &InstallationPatch,
    ) -> TransportResult<()>;

    /// Reports delivered incoming messages.
    fn sync_messages(&self, request: &MessagesSyncRequest) -> TransportResult<()>;

    /// Sends outgoing messages.
    fn send_messages(&self, request: &MoMessagesRequest) -> TransportResult<MoMessagesResponse>;
}

/// A recorded call against [`MockBackend`].
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    /// `create_installation`.
    CreateInstallation(CreateInstallationRequest),
    /// `patch_installation`.
    PatchInstallation {
        /// Target registration id.
        registration_id: String,
        /// Patch sent.
        patch: InstallationPatch,
    },
    /// `sync_messages`.
    SyncMessages(MessagesSyncRequest),
    /// `send_messages`.
    SendMessages(MoMessagesRequest),
}

/// A scripted backend for testing.
///
/// Every call is recorded. Calls succeed unless a failure has been queued
/// with [`fail_next`](Self::fail_next); queued failures are consumed in
/// order, one per call, regardless of which operation is called.
#[derive(Debug)]
pub struct MockBackend {
    calls: Mutex<Vec<BackendCall>>,
    failures: Mutex<VecDeque<TransportError>>,
    registration_id: Mutex<String>,
    rejected: Mutex<HashSet<String>>,
    latency: Mutex<Duration>,
    observer: Option<mpsc::UnboundedSender<BackendCall>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    /// Creates a mock backend where every call succeeds.
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(VecDeque::new()),
            registration_id: Mutex::new("reg-1".to_string()),
            rejected: Mutex::new(HashSet::new()),
            latency: Mutex::new(Duration::ZERO),
            observer: None,
        }
    }

    /// Creates a mock backend that also streams every call to a channel.
    pub fn with_observer() -> (Self, mpsc::UnboundedReceiver<BackendCall>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut backend = Self::new();
        backend.observer = Some(tx);
        (backend, rx)
    }

    /// Makes the next call fail with `error`.
    pub fn fail_next(&self, error: TransportError) {
        self.failures.lock().push_back(error);
    }

    /// Sets the registration id handed out by `create_installation`.
    pub fn set_registration_id(&self, registration_id: impl Into<String>) {
        *self.registration_id.lock() = registration_id.into();
    }

    /// Makes `send_messages` report `message_id` as rejected.
    pub fn reject_message(&self, message_id: impl Into<String>) {
        self.rejected.lock().insert(message_id.into());
    }

    /// Adds a blocking delay to every call.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Returns all calls made so far.
    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().clone()
    }

    /// Returns the number of calls made so far.
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    fn record(&self, call: BackendCall) -> TransportResult<()> {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }

        self.calls.lock().push(call.clone());
        if let Some(observer) = &self.observer {
            let _ = observer.send(call);
        }

        match self.failures.lock().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl BackendClient for MockBackend {
    fn create_installation(
        &self,
        request: &CreateInstallationRequest,
    ) -> TransportResult<RegistrationResponse> {
        self.record(BackendCall::CreateInstallation(request.clone()))?;
        Ok(RegistrationResponse {
            registration_id: self.registration_id.lock().clone(),
        })
    }

    fn patch_installation(
        &self,
        registration_id: &str,
        patch: &InstallationPatch,
    ) -> TransportResult<()> {
        self.record(BackendCall::PatchInstallation {
            registration_id: registration_id.to_string(),
            patch: patch.clone(),
        })
    }

    fn sync_messages(&self, request: &MessagesSyncRequest) -> TransportResult<()> {
        self.record(BackendCall::SyncMessages(request.clone()))
    }

    fn send_messages(&self, request: &MoMessagesRequest) -> TransportResult<MoMessagesResponse> {
        self.record(BackendCall::SendMessages(request.clone()))?;

        let rejected = self.rejected.lock();
        let results = request
            .messages
            .iter()
            .map(|message| {
                let accepted = !rejected.contains(&message.message_id);
                MoMessageResult {
                    message_id: message.message_id.clone(),
                    status: if accepted {
                        MessageStatus::Sent
                    } else {
                        MessageStatus::Failed
                    },
                    status_message: (!accepted).then(|| "rejected".to_string()),
                }
            })
            .collect();

        Ok(MoMessagesResponse { results })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_records_calls() {
        let backend = MockBackend::new();
        backend
            .sync_messages(&MessagesSyncRequest {
                registration_id: "r".into(),
                delivered_message_ids: vec!["m1".into()],
            })
            .unwrap();

        assert_eq!(backend.call_count(), 1);
        assert!(matches!(backend.calls()[0], BackendCall::SyncMessages(_)));
    }

    #[test]
    fn mock_queued_failures_are_consumed_in_order() {
        let backend = MockBackend::new();
        backend.fail_next(TransportError::backend(500, "5xx", "first"));
        backend.fail_next(TransportError::connection("second"));

        let patch = InstallationPatch::default();
        let first = backend.patch_installation("r", &patch).unwrap_err();
        let second = backend.patch_installation("r", &patch).unwrap_err();
        assert_eq!(first.message, "first");
        assert_eq!(second.message, "second");
        assert!(backend.patch_installation("r", &patch).is_ok());
        assert_eq!(backend.call_count(), 3);
    }

    #[test]
    fn mock_rejects_selected_messages() {
        let backend = MockBackend::new();
        backend.reject_message("m2");

        let response = backend
            .send_messages(&MoMessagesRequest {
                registration_id: "r".into(),
                messages: vec![MoMessage::new("m1", "a", 0), MoMessage::new("m2", "b", 0)],
            })
            .unwrap();

        assert_eq!(response.results[0].status, MessageStatus::Sent);
        assert_eq!(response.results[1].status, MessageStatus::Failed);
    }

    #[test]
    fn mock_create_returns_configured_id() {
        let backend = MockBackend::new();
        backend.set_registration_id("abc");

        let response = backend
            .create_installation(&CreateInstallationRequest {
                push_token: "t".into(),
                patch: InstallationPatch::default(),
            })
            .unwrap();
        assert_eq!(response.registration_id, "abc");
    }

    #[test]
    fn transport_error_display() {
        let err = TransportError::backend(400, "INVALID_PARAMETER", "bad email");
        assert_eq!(err.to_string(), "400 INVALID_PARAMETER: bad email");
        assert_eq!(TransportError::connection("refused").to_string(), "refused");
    }
}
