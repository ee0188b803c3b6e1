//! Transport kinds and the negotiation history record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Underlying mechanism for the bidirectional channel.
///
/// The declaration order is the default preference order: native
/// full-duplex first, polling fallbacks last.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// Full-duplex WebSocket.
    #[serde(rename = "websocket")]
    WebSocket,
    /// Server-sent event stream for inbound, HTTP POST for outbound.
    LongPollStreaming,
    /// Repeated HTTP long-poll requests for inbound, HTTP POST for outbound.
    LongPoll,
    /// In-process channel (tests and embedding).
    Memory,
}

impl TransportKind {
    /// Default negotiation order.
    pub const DEFAULT_ORDER: [TransportKind; 3] =
        [Self::WebSocket, Self::LongPollStreaming, Self::LongPoll];

    /// Wire name of the transport.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WebSocket => "websocket",
            Self::LongPollStreaming => "long-poll-streaming",
            Self::LongPoll => "long-poll",
            Self::Memory => "memory",
        }
    }

    /// Whether a network connector exists for this transport.
    pub fn is_network(self) -> bool {
        !matches!(self, Self::Memory)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "websocket" | "ws" => Ok(Self::WebSocket),
            "long-poll-streaming" | "streaming" | "sse" => Ok(Self::LongPollStreaming),
            "long-poll" | "polling" => Ok(Self::LongPoll),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown transport '{other}'")),
        }
    }
}

/// Outcome recorded for one transport attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptOutcome {
    /// The attempt started.
    Attempting,
    /// The transport opened.
    Connected,
    /// The transport failed or timed out.
    Failed,
}

/// Append-only negotiation history record, used for diagnostics only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportAttempt {
    /// Transport that was tried.
    pub transport: TransportKind,
    /// When the record was written.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub outcome: AttemptOutcome,
    /// Failure detail, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl TransportAttempt {
    /// Record the start of an attempt.
    pub fn attempting(transport: TransportKind) -> Self {
        Self {
            transport,
            timestamp: Utc::now(),
            outcome: AttemptOutcome::Attempting,
            reason: None,
        }
    }

    /// Record a successful attempt.
    pub fn connected(transport: TransportKind) -> Self {
        Self {
            transport,
            timestamp: Utc::now(),
            outcome: AttemptOutcome::Connected,
            reason: None,
        }
    }

    /// Record a failed attempt.
    pub fn failed(transport: TransportKind, reason: impl Into<String>) -> Self {
        Self {
            transport,
            timestamp: Utc::now(),
            outcome: AttemptOutcome::Failed,
            reason: Some(reason.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names() {
        assert_eq!(
            serde_json::to_string(&TransportKind::WebSocket).unwrap(),
            "\"websocket\""
        );
        assert_eq!(
            serde_json::to_string(&TransportKind::LongPollStreaming).unwrap(),
            "\"long-poll-streaming\""
        );
        assert_eq!(
            serde_json::to_string(&TransportKind::LongPoll).unwrap(),
            "\"long-poll\""
        );
    }

    #[test]
    fn display_matches_serde() {
        for kind in TransportKind::DEFAULT_ORDER {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{kind}\""));
        }
    }

    #[test]
    fn parse_aliases() {
        assert_eq!("ws".parse::<TransportKind>(), Ok(TransportKind::WebSocket));
        assert_eq!(
            " SSE ".parse::<TransportKind>(),
            Ok(TransportKind::LongPollStreaming)
        );
        assert_eq!("polling".parse::<TransportKind>(), Ok(TransportKind::LongPoll));
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
    }

    #[test]
    fn memory_is_not_a_network_transport() {
        assert!(TransportKind::DEFAULT_ORDER.iter().all(|k| k.is_network()));
        assert!(!TransportKind::Memory.is_network());
    }

    #[test]
    fn default_order_is_most_capable_first() {
        assert_eq!(TransportKind::DEFAULT_ORDER[0], TransportKind::WebSocket);
        assert_eq!(TransportKind::DEFAULT_ORDER[2], TransportKind::LongPoll);
    }

    #[test]
    fn failed_attempt_carries_reason() {
        let attempt = TransportAttempt::failed(TransportKind::LongPoll, "timed out");
        assert_eq!(attempt.outcome, AttemptOutcome::Failed);
        assert_eq!(attempt.reason.as_deref(), Some("timed out"));
        let json = serde_json::to_value(&attempt).unwrap();
        assert_eq!(json["outcome"], "failed");
        assert_eq!(json["transport"], "long-poll");
    }

    #[test]
    fn attempting_omits_reason() {
        let json = serde_json::to_value(TransportAttempt::attempting(TransportKind::WebSocket))
            .unwrap();
        assert!(json.get("reason").is_none());
    }
}
