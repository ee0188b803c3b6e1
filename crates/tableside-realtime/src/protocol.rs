//! Wire envelope shared by every transport.
//!
//! Each frame (WebSocket text message, SSE `data:` line, long-poll array
//! element, POST body) is one JSON object:
//!
//! ```json
//! {"event": "order_notification", "data": {...}, "ackId": 7, "error": "..."}
//! ```
//!
//! `ackId` is set on requests that expect an acknowledgement and echoed on
//! the `ack` reply; `error` marks a negative ack.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use tableside_core::TenantId;

/// Reserved event names. Everything else is a notification candidate.
pub mod events {
    /// Client → server tenant binding, acknowledged.
    pub const JOIN: &str = "join";
    /// Heartbeat request, `data: {seq}`.
    pub const PING: &str = "ping";
    /// Heartbeat reply echoing the ping's `seq`.
    pub const PONG: &str = "pong";
    /// Acknowledgement resolving an `ackId`.
    pub const ACK: &str = "ack";

    /// Whether `event` is handled by the connection itself.
    pub fn is_reserved(event: &str) -> bool {
        matches!(event, JOIN | PING | PONG | ACK)
    }
}

/// One message on the channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Event name.
    pub event: String,
    /// Event payload; `null` when absent.
    #[serde(default)]
    pub data: Value,
    /// Correlation id for acknowledged requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_id: Option<u64>,
    /// Error text on a negative ack.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Envelope {
    /// Fire-and-forget envelope.
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
            ack_id: None,
            error: None,
        }
    }

    /// Envelope that expects an `ack` carrying the same id.
    pub fn with_ack(event: impl Into<String>, data: Value, ack_id: u64) -> Self {
        Self {
            ack_id: Some(ack_id),
            ..Self::new(event, data)
        }
    }

    /// Positive acknowledgement.
    pub fn ack(ack_id: u64, data: Value) -> Self {
        Self::with_ack(events::ACK, data, ack_id)
    }

    /// Negative acknowledgement.
    pub fn nack(ack_id: u64, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::with_ack(events::ACK, Value::Null, ack_id)
        }
    }

    /// Heartbeat ping.
    pub fn ping(seq: u64) -> Self {
        Self::new(events::PING, json!({ "seq": seq }))
    }

    /// Heartbeat pong.
    pub fn pong(seq: u64) -> Self {
        Self::new(events::PONG, json!({ "seq": seq }))
    }

    /// Payload of the tenant handshake.
    pub fn join_payload(tenant: &TenantId) -> Value {
        json!({ "restaurantId": tenant.as_str() })
    }

    /// `data.seq` of a ping or pong.
    pub fn seq(&self) -> Option<u64> {
        self.data.get("seq").and_then(Value::as_u64)
    }

    /// Parse one frame.
    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Serialize to one frame.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
