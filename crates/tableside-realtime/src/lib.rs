//! # tableside-realtime
//!
//! Keeps a realtime channel to the backend event hub alive and fans out
//! tenant-scoped order, table and payment notifications.
//!
//! - **Transports**: WebSocket, SSE streaming and plain long-poll channels
//!   behind the [`Connector`] trait, plus an in-process memory connector
//! - **Negotiation**: ordered fallback with per-attempt timeouts
//! - **Heartbeat**: ping/pong liveness with a miss threshold
//! - **Reconnect**: exponential backoff, attempt ceiling, health probe
//! - **Fan-out**: [`SubscriptionRegistry`] and [`NotificationDispatcher`]
//! - **Manager**: [`ConnectionManager`], the state machine that drives it all

#![deny(unsafe_code)]

pub mod config;
pub mod diagnostics;
pub mod dispatcher;
pub mod errors;
pub mod health;
pub mod heartbeat;
pub mod manager;
pub mod negotiator;
pub mod protocol;
pub mod reconnect;
pub mod registry;
pub mod state_machine;
pub mod transport;

pub use config::{ConnectionConfig, HealthConfig};
pub use diagnostics::{Diagnostics, DiagnosticsSnapshot, RejectedMessage};
pub use dispatcher::{DispatchOutcome, NotificationDispatcher};
pub use errors::{RealtimeError, Result, TransportError};
pub use health::{HealthProbe, HttpHealthProbe};
pub use heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatResult};
pub use manager::{ConnectionManager, ConnectionManagerBuilder, StatusCallback};
pub use negotiator::TransportNegotiator;
pub use protocol::Envelope;
pub use registry::{NotificationCallback, SubscriptionRegistry};
pub use state_machine::{StateChange, Trigger};
pub use transport::{Channel, ChannelEvent, Connector, Endpoint};
