//! Connection lifecycle transition table.
//!
//! [`transition`] is pure: it says where a [`Trigger`] leads from a given
//! [`ConnectionState`], or `None` when the trigger does not apply. The
//! manager applies the result under its session lock and fires status
//! callbacks only for applied transitions.

use std::fmt;

use tableside_core::ConnectionState;

/// Something that can move the connection between states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Trigger {
    /// Explicit `connect()` or `force_reconnect()`.
    Connect,
    /// The negotiator opened a channel.
    TransportEstablished,
    /// Every transport failed during a negotiation.
    TransportsExhausted,
    /// The backend acknowledged the tenant handshake.
    HandshakeAcked,
    /// The channel closed or the heartbeat threshold was reached.
    ChannelLost,
    /// The reconnect attempt ceiling was reached.
    AttemptsExhausted,
    /// The out-of-band health probe failed while `FAILED`.
    HealthProbeFailed,
    /// Explicit `disconnect()`.
    Disconnect,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connect => "connect",
            Self::TransportEstablished => "transport_established",
            Self::TransportsExhausted => "transports_exhausted",
            Self::HandshakeAcked => "handshake_acked",
            Self::ChannelLost => "channel_lost",
            Self::AttemptsExhausted => "attempts_exhausted",
            Self::HealthProbeFailed => "health_probe_failed",
            Self::Disconnect => "disconnect",
        };
        f.write_str(name)
    }
}

/// Target state for `trigger` in `from`, if the transition is allowed.
pub fn transition(from: ConnectionState, trigger: Trigger) -> Option<ConnectionState> {
    use ConnectionState as S;

    match (from, trigger) {
        (S::Disconnected | S::Failed | S::ServerDown, Trigger::Connect) => Some(S::Connecting),
        (S::Connecting | S::Reconnecting, Trigger::TransportEstablished) => Some(S::Connected),
        (S::Connecting, Trigger::TransportsExhausted) => Some(S::Reconnecting),
        (S::Connected, Trigger::HandshakeAcked) => Some(S::Authenticated),
        (S::Connected | S::Authenticated, Trigger::ChannelLost) => Some(S::Reconnecting),
        (S::Connecting | S::Reconnecting, Trigger::AttemptsExhausted) => Some(S::Failed),
        (S::Failed, Trigger::HealthProbeFailed) => Some(S::ServerDown),
        (S::Disconnected, Trigger::Disconnect) => None,
        (_, Trigger::Disconnect) => Some(S::Disconnected),
        _ => None,
    }
}

/// An applied transition, as passed to status callbacks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateChange {
    /// State before the transition.
    pub from: ConnectionState,
    /// State after the transition.
    pub to: ConnectionState,
    /// What caused it.
    pub trigger: Trigger,
}
