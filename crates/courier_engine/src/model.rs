//! Domain records carried by the synchronizers.

use crate::outbox::OutboxItem;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A custom attribute value on an installation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    /// Free text.
    Text(String),
    /// Numeric value.
    Number(f64),
    /// Boolean flag.
    Boolean(bool),
    /// Date as epoch milliseconds.
    Date(i64),
}

/// The installation as known locally.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Installation {
    /// Server-assigned registration id, once created.
    pub registration_id: Option<String>,
    /// Push token supplied by the platform.
    pub push_token: Option<String>,
    /// Whether this device is the user's primary device.
    pub is_primary_device: bool,
    /// User-supplied custom attributes.
    pub custom_attributes: BTreeMap<String, AttributeValue>,
}

/// A partial installation update.
///
/// Only fields with pending local changes are set, so a patch never
/// overwrites server-held fields the client did not touch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstallationPatch {
    /// New push token.
    pub push_token: Option<String>,
    /// New primary-device flag.
    pub is_primary_device: Option<bool>,
    /// Changed attributes; `None` deletes the attribute on the server.
    pub custom_attributes: BTreeMap<String, Option<AttributeValue>>,
}

impl InstallationPatch {
    /// Returns true if the patch carries no changes.
    pub fn is_empty(&self) -> bool {
        self.push_token.is_none()
            && self.is_primary_device.is_none()
            && self.custom_attributes.is_empty()
    }
}

/// Delivery state of an outgoing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    /// Not yet acknowledged by the backend.
    Pending,
    /// Accepted by the backend.
    Sent,
    /// Rejected by the backend.
    Failed,
}

/// A mobile-originated (outgoing) message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoMessage {
    /// Client-generated unique id.
    pub message_id: String,
    /// Optional destination address.
    pub destination: Option<String>,
    /// Message body.
    pub text: String,
    /// Creation time in epoch milliseconds.
    pub created_at: i64,
    /// Delivery state.
    pub status: MessageStatus,
}

impl MoMessage {
    /// Creates a pending message.
    pub fn new(message_id: impl Into<String>, text: impl Into<String>, created_at: i64) -> Self {
        Self {
            message_id: message_id.into(),
            destination: None,
            text: text.into(),
            created_at,
            status: MessageStatus::Pending,
        }
    }

    /// Sets the destination address.
    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }
}

impl OutboxItem for MoMessage {
    fn id(&self) -> &str {
        &self.message_id
    }

    fn received_at(&self) -> i64 {
        self.created_at
    }
}

/// Acknowledgement that an incoming message reached this device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReport {
    /// Id of the delivered message.
    pub message_id: String,
    /// When the message was received, epoch milliseconds.
    pub received_at: i64,
}

impl DeliveryReport {
    /// Creates a delivery report.
    pub fn new(message_id: impl Into<String>, received_at: i64) -> Self {
        Self {
            message_id: message_id.into(),
            received_at,
        }
    }
}

impl OutboxItem for DeliveryReport {
    fn id(&self) -> &str {
        &self.message_id
    }

    fn received_at(&self) -> i64 {
        self.received_at
    }
}
