//! The wire envelope every bus message is wrapped in.
//!
//! Every publish, request, response, and acknowledgement travelling over the
//! [`BusConnector`](crate::hsp::bus::BusConnector) is framed as an [`Envelope`]
//! before it hits the transport. The envelope carries routing and correlation
//! metadata; the domain payload (a [`CapabilityAdvertisement`](crate::hsp::messages::CapabilityAdvertisement),
//! [`TaskRequest`](crate::hsp::messages::TaskRequest), etc.) is serialized into
//! its `payload` field.
//!
//! # Example
//!
//! ```
//! use hsp_orchestrator::hsp::envelope::{Envelope, Pattern};
//!
//! let env = Envelope::publish("agent://math-1", "hsp/facts/weather", "fact/1.0", serde_json::json!({"ok": true}));
//! assert_eq!(env.pattern, Pattern::Publish);
//! assert!(env.correlation_id.is_none());
//!
//! let bytes = env.to_json().unwrap();
//! let decoded = Envelope::from_json(&bytes).unwrap();
//! assert_eq!(decoded.message_id, env.message_id);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// The envelope protocol version this crate speaks. Bumped on breaking wire changes.
pub const PROTOCOL_VERSION: &str = "1.0";
/// The envelope schema version. Distinct from [`PROTOCOL_VERSION`] so the envelope
/// shape can evolve independently of the higher-level message protocol.
pub const ENVELOPE_VERSION: &str = "1.0";

/// How a message relates to a conversation: fire-and-forget, a correlated
/// request/response pair, or a transport-level acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pattern {
    Publish,
    Request,
    Response,
    Acknowledgement,
}

/// Optional quality-of-service hints attached to an envelope.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Qos {
    /// 1 (lowest) through 5 (highest).
    pub priority: u8,
    /// Whether the receiver should emit an `ack/1.0` envelope referencing this message.
    pub requires_ack: bool,
}

impl Default for Qos {
    fn default() -> Self {
        Self {
            priority: 3,
            requires_ack: false,
        }
    }
}

/// Optional message-signing parameters. The signature scheme itself is out of
/// scope; this only carries the bytes and the key identifier a verifier needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityParams {
    pub signature: Vec<u8>,
    pub key_id: String,
}

/// A namespaced, semver-suffixed message type, e.g. `task-request/1.0`.
///
/// Stored as a plain string on the wire; this wrapper exists so callers match
/// on a typed value instead of re-parsing the suffix at every call site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageType(pub String);

impl MessageType {
    pub fn new(namespace: &str, version: &str) -> Self {
        Self(format!("{}/{}", namespace, version))
    }

    /// The part before the final `/version` suffix.
    pub fn namespace(&self) -> &str {
        self.0.rsplit_once('/').map_or(self.0.as_str(), |(ns, _)| ns)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MessageType {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Every field the bus protocol requires or permits on a single message.
///
/// See the module docs for how an envelope relates to the typed payloads in
/// [`crate::hsp::messages`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub protocol_version: String,
    pub envelope_version: String,
    pub message_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub sender_id: String,
    pub recipient: String,
    pub timestamp: DateTime<Utc>,
    pub message_type: MessageType,
    pub pattern: Pattern,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qos: Option<Qos>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security: Option<SecurityParams>,
    pub payload: serde_json::Value,
}

/// Raised when an inbound byte blob cannot be parsed into an [`Envelope`].
///
/// Per spec, malformed inbound messages are logged and dropped — they are
/// never delivered to a subscriber. Callers of [`Envelope::from_json`] are
/// expected to do exactly that.
#[derive(Debug)]
pub struct EnvelopeDecodeError(pub String);

impl fmt::Display for EnvelopeDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed envelope: {}", self.0)
    }
}

impl std::error::Error for EnvelopeDecodeError {}

impl Envelope {
    fn new(
        sender_id: impl Into<String>,
        recipient: impl Into<String>,
        message_type: impl Into<MessageType>,
        pattern: Pattern,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            envelope_version: ENVELOPE_VERSION.to_string(),
            message_id: Uuid::new_v4().to_string(),
            correlation_id: None,
            sender_id: sender_id.into(),
            recipient: recipient.into(),
            timestamp: Utc::now(),
            message_type: message_type.into(),
            pattern,
            qos: None,
            security: None,
            payload,
        }
    }

    /// Build a fire-and-forget publish envelope. No correlation id.
    pub fn publish(
        sender_id: impl Into<String>,
        topic: impl Into<String>,
        message_type: impl Into<MessageType>,
        payload: serde_json::Value,
    ) -> Self {
        Self::new(sender_id, topic, message_type, Pattern::Publish, payload)
    }

    /// Build a request envelope. The caller is expected to install a
    /// correlation slot under `message_id` before sending it.
    pub fn request(
        sender_id: impl Into<String>,
        topic: impl Into<String>,
        message_type: impl Into<MessageType>,
        payload: serde_json::Value,
    ) -> Self {
        Self::new(sender_id, topic, message_type, Pattern::Request, payload)
    }

    /// Build a response envelope correlated to `request_message_id`.
    pub fn response(
        sender_id: impl Into<String>,
        recipient: impl Into<String>,
        request_message_id: impl Into<String>,
        message_type: impl Into<MessageType>,
        payload: serde_json::Value,
    ) -> Self {
        let mut env = Self::new(sender_id, recipient, message_type, Pattern::Response, payload);
        env.correlation_id = Some(request_message_id.into());
        env
    }

    /// Build an acknowledgement envelope for `acked_message_id`.
    pub fn acknowledgement(
        sender_id: impl Into<String>,
        recipient: impl Into<String>,
        acked_message_id: impl Into<String>,
    ) -> Self {
        let mut env = Self::new(
            sender_id,
            recipient,
            MessageType::new("ack", "1.0"),
            Pattern::Acknowledgement,
            serde_json::Value::Null,
        );
        env.correlation_id = Some(acked_message_id.into());
        env
    }

    pub fn with_qos(mut self, qos: Qos) -> Self {
        self.qos = Some(qos);
        self
    }

    pub fn with_security(mut self, security: SecurityParams) -> Self {
        self.security = Some(security);
        self
    }

    pub fn requires_ack(&self) -> bool {
        self.qos.map(|q| q.requires_ack).unwrap_or(false)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse a raw bus payload into an envelope. Every field required by the
    /// wire protocol must be present; anything else is a decode error, never
    /// a panic.
    pub fn from_json(bytes: &[u8]) -> Result<Self, EnvelopeDecodeError> {
        serde_json::from_slice(bytes).map_err(|e| EnvelopeDecodeError(e.to_string()))
    }
}
