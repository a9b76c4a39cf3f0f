//! # Courier Engine
//!
//! Reliable delivery synchronization engine for Courier.
//!
//! This crate provides:
//! - Declarative retry policies with quadratic backoff
//! - A single-shot task executor and a retrying task runner
//! - Trailing-edge batching of bursty reports
//! - A durable, deduplicating outbox with expiry
//! - Throttled synchronizers for installations, delivery reports and
//!   outgoing messages
//!
//! ## Architecture
//!
//! External triggers (lifecycle events, explicit calls, connectivity) reach a
//! synchronizer, which decides whether to act, builds a unit of work and
//! hands it to the [`RetryableTaskRunner`]. The runner executes it on the
//! [`Scheduler`] through the [`TaskExecutor`], consults the [`RetryPolicy`]
//! on failure and either re-arms a timer or reports a terminal outcome. The
//! synchronizer then updates durable state and notifies the
//! [`Broadcaster`] and the caller's [`ResultListener`].
//!
//! ## Key Invariants
//!
//! - Entry points never block; results arrive through callbacks
//! - A result listener is invoked exactly once per top-level call
//! - At most one round-trip per synchronizer is in flight
//! - Outbox entries are unique by id and never delivered after expiry
//! - Retries never repeat the `before` hook

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod batch;
mod broadcast;
mod clock;
mod config;
mod engine;
mod error;
mod executor;
mod model;
mod outbox;
mod policy;
mod runner;
mod scheduler;
mod sync;
mod throttle;
mod transport;

pub use batch::BatchReporter;
pub use broadcast::{BroadcastEvent, Broadcaster, NoopBroadcaster, RecordingBroadcaster};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use engine::{SyncEngine, SyncEngineBuilder};
pub use error::{ErrorKind, SyncError, SyncResult};
pub use executor::{classify, TaskExecutor, INVALID_PARAMETER, SERVER_ERROR_CODE, UNKNOWN_BACKEND_ERROR};
pub use model::{
    AttributeValue, DeliveryReport, Installation, InstallationPatch, MessageStatus, MoMessage,
};
pub use outbox::{
    decode_entry, encode_entry, Outbox, OutboxEntry, OutboxItem, DELIVERY_OUTBOX_KEY,
    OUTGOING_OUTBOX_KEY,
};
pub use policy::{RetryPolicy, RetryPolicyBuilder};
pub use runner::{ExecutionContext, RetryableTask, RetryableTaskRunner};
pub use scheduler::{Job, Scheduler, TimerHandle};
pub use sync::{
    InstallationState, InstallationSynchronizer, MessagesSynchronizer, MoMessageSynchronizer,
    ResultListener, SyncContext, SyncMode, INSTALLATION_KEY,
};
pub use throttle::SyncThrottle;
pub use transport::{
    BackendCall, BackendClient, CreateInstallationRequest, MessagesSyncRequest, MockBackend,
    MoMessageResult, MoMessagesRequest, MoMessagesResponse, RegistrationResponse, TransportError,
    TransportResult,
};
