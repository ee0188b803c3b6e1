//! # tableside-core
//!
//! Shared vocabulary for the Tableside realtime connection manager.
//!
//! - **Branded IDs**: `TenantId`, `SubscriptionId`, `CallbackId` as newtypes
//! - **Connection state**: the process-wide [`ConnectionState`] enum
//! - **Transports**: [`TransportKind`] and the [`TransportAttempt`] history record
//! - **Stats**: the [`ConnectionStats`] snapshot handed to callers
//! - **Notifications**: the validated [`Notification`] value and its schema
//! - **Backoff**: exponential reconnect delay math
//! - **Logging**: `tracing` subscriber setup and test capture helpers

#![deny(unsafe_code)]

pub mod backoff;
pub mod constants;
pub mod ids;
pub mod logging;
pub mod notification;
pub mod state;
pub mod stats;
pub mod transport;

pub use ids::{CallbackId, SubscriptionId, TenantId};
pub use notification::{Notification, OrderStatus, RejectReason};
pub use state::ConnectionState;
pub use stats::ConnectionStats;
pub use transport::{AttemptOutcome, TransportAttempt, TransportKind};
