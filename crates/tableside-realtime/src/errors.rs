//! Error types for transports and the connection manager.

use std::time::Duration;

use tableside_core::{ConnectionState, TransportAttempt, TransportKind};
use thiserror::Error;

/// Failure of a single transport channel.
///
/// These never reach callers of the connection manager directly: the
/// negotiator records them as failed attempts and reconnection takes over.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Opening the transport took longer than the per-attempt timeout.
    #[error("transport timed out after {0:?}")]
    Timeout(Duration),
    /// The connection could not be established.
    #[error("connection failed: {0}")]
    Connect(String),
    /// The server answered with a non-success HTTP status.
    #[error("HTTP {status} from {url}")]
    Http {
        /// Response status code.
        status: u16,
        /// Requested URL (query string stripped).
        url: String,
    },
    /// WebSocket protocol or I/O failure.
    #[error("websocket error: {0}")]
    WebSocket(String),
    /// The channel is closed and can no longer send.
    #[error("channel closed: {0}")]
    Closed(String),
    /// An envelope could not be serialized.
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
    /// The configured server URL cannot be used.
    #[error("invalid server URL: {0}")]
    InvalidUrl(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::Http {
                status: status.as_u16(),
                url: err.url().map(redact_url).unwrap_or_default(),
            };
        }
        Self::Connect(err.without_url().to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(err.to_string())
    }
}

/// Render a URL without its query string, which may carry the auth token.
pub(crate) fn redact_url(url: &reqwest::Url) -> String {
    let mut clean = url.clone();
    clean.set_query(None);
    clean.to_string()
}

/// Errors returned to callers of the connection manager.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// `emit` was called while no channel is live.
    #[error("not connected (state: {state})")]
    NotConnected {
        /// State at the time of the call.
        state: ConnectionState,
    },
    /// The server did not acknowledge an emitted event in time.
    #[error("no ack for '{event}' within {timeout:?}")]
    AckTimeout {
        /// Emitted event name.
        event: String,
        /// Timeout that elapsed.
        timeout: Duration,
    },
    /// The server answered with a negative ack.
    #[error("'{event}' rejected by server: {reason}")]
    AckRejected {
        /// Emitted event name.
        event: String,
        /// Error text from the ack.
        reason: String,
    },
    /// The channel closed before the ack arrived.
    #[error("channel closed before ack")]
    ChannelClosed,
    /// Every configured transport failed on the first attempt of a session.
    #[error("all transports failed ({} attempt records)", .attempts.len())]
    NegotiationFailed {
        /// Full attempt history of the negotiation.
        attempts: Vec<TransportAttempt>,
    },
    /// The tenant identifier is empty.
    #[error("invalid tenant id: '{0}'")]
    InvalidTenant(String),
    /// The connect call was overtaken by `disconnect()` or another session.
    #[error("connection attempt superseded")]
    Superseded,
    /// No connector is available for any configured transport.
    #[error("no usable transport among {0:?}")]
    NoTransports(Vec<TransportKind>),
    /// Transport setup failed before negotiation could start.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// A payload could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for connection manager operations.
pub type Result<T> = std::result::Result<T, RealtimeError>;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
