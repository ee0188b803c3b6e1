//! Connection statistics snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::transport::TransportKind;

/// Counters and gauges describing the realtime connection.
///
/// The connection manager owns the live copy; callers only ever see clones.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    /// Whether a transport channel is currently up.
    pub is_connected: bool,
    /// Failed reconnection attempts in the current outage.
    pub reconnect_attempts: u32,
    /// Ceiling after which the connection is marked failed.
    pub max_reconnect_attempts: u32,
    /// Consecutive heartbeats without a pong.
    pub missed_heartbeats: u32,
    /// When the last pong arrived.
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// Envelopes written to the channel.
    pub messages_sent: u64,
    /// Envelopes read from the channel.
    pub messages_received: u64,
    /// Round-trip time of the last heartbeat in milliseconds.
    pub latency_ms: Option<f64>,
    /// Transport of the live channel.
    pub current_transport: Option<TransportKind>,
    /// Transports tried by the latest negotiation, in order.
    pub attempted_transports: Vec<TransportKind>,
}

impl ConnectionStats {
    /// Fresh stats for a manager with the given reconnect ceiling.
    pub fn new(max_reconnect_attempts: u32) -> Self {
        Self {
            max_reconnect_attempts,
            ..Self::default()
        }
    }

    /// Reset everything except the configured ceiling.
    pub fn reset(&mut self) {
        *self = Self::new(self.max_reconnect_attempts);
    }

    /// Mark the channel as lost. Traffic and heartbeat counters are kept for
    /// diagnostics until the next channel is installed.
    pub fn mark_channel_lost(&mut self) {
        self.is_connected = false;
        self.current_transport = None;
    }

    /// Record a freshly established channel.
    pub fn mark_channel_up(&mut self, transport: TransportKind) {
        self.is_connected = true;
        self.current_transport = Some(transport);
        self.missed_heartbeats = 0;
    }
}
