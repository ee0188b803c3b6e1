//! Connection lifecycle state.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of the realtime connection.
///
/// Exactly one value is live per connection manager. The happy path is
/// `Disconnected → Connecting → Connected → Authenticated`; `Reconnecting`,
/// `Failed` and `ServerDown` are the recovery and terminal branches.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// No channel and no pending reconnection.
    #[default]
    Disconnected,
    /// First negotiation of a session in progress.
    Connecting,
    /// A transport channel is established; tenant handshake pending.
    Connected,
    /// The backend acknowledged the tenant binding.
    Authenticated,
    /// Channel lost; the reconnection scheduler owns the next attempt.
    Reconnecting,
    /// Reconnection attempts exhausted for this session.
    Failed,
    /// Reconnection exhausted and the backend health probe failed too.
    ServerDown,
}

impl ConnectionState {
    /// Whether a transport channel is up (`Connected` or `Authenticated`).
    pub fn is_live(self) -> bool {
        matches!(self, Self::Connected | Self::Authenticated)
    }

    /// Whether automatic recovery has stopped (`Failed` or `ServerDown`).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::ServerDown)
    }

    /// Wire name of the state.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Authenticated => "AUTHENTICATED",
            Self::Reconnecting => "RECONNECTING",
            Self::Failed => "FAILED",
            Self::ServerDown => "SERVER_DOWN",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
