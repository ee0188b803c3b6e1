//! Runtime configuration for the connection manager.
//!
//! [`ConnectionConfig`] is the `Duration`-typed view of
//! [`RealtimeSettings`]; the manager never reads raw millisecond values.

use std::time::Duration;

use tableside_core::TransportKind;
use tableside_core::backoff::BackoffPolicy;
use tableside_settings::{DiagnosticsSettings, RealtimeSettings};

use crate::heartbeat::HeartbeatConfig;

/// Out-of-band health probe configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct HealthConfig {
    /// Path of the health endpoint, relative to the server URL.
    pub path: String,
    /// Probe timeout.
    pub timeout: Duration,
}

/// Connection manager configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionConfig {
    /// Base URL of the backend.
    pub server_url: String,
    /// Path prefix of the realtime endpoints.
    pub path: String,
    /// Transport preference order.
    pub transports: Vec<TransportKind>,
    /// Per-transport open timeout.
    pub connect_timeout: Duration,
    /// Tenant handshake ack timeout.
    pub handshake_timeout: Duration,
    /// `emit` ack timeout.
    pub ack_timeout: Duration,
    /// Bearer token presented to the backend.
    pub auth_token: Option<String>,
    /// Heartbeat parameters.
    pub heartbeat: HeartbeatConfig,
    /// Reconnect backoff.
    pub backoff: BackoffPolicy,
    /// Health probe, `None` when disabled.
    pub health: Option<HealthConfig>,
    /// Diagnostic ring buffer capacities.
    pub diagnostics: DiagnosticsSettings,
}

impl From<&RealtimeSettings> for ConnectionConfig {
    fn from(settings: &RealtimeSettings) -> Self {
        Self {
            server_url: settings.server_url.clone(),
            path: settings.path.clone(),
            transports: settings.transports.clone(),
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
            handshake_timeout: Duration::from_millis(settings.handshake_timeout_ms),
            ack_timeout: Duration::from_millis(settings.ack_timeout_ms),
            auth_token: settings.auth_token.clone(),
            heartbeat: HeartbeatConfig {
                interval: Duration::from_millis(settings.heartbeat.interval_ms),
                timeout: Duration::from_millis(settings.heartbeat.timeout_ms),
                max_missed: settings.heartbeat.max_missed,
            },
            backoff: BackoffPolicy {
                max_attempts: settings.reconnect.max_attempts,
                base_delay_ms: settings.reconnect.base_delay_ms,
                max_delay_ms: settings.reconnect.max_delay_ms,
                jitter_factor: settings.reconnect.jitter_factor,
            },
            health: settings.health.enabled.then(|| HealthConfig {
                path: settings.health.path.clone(),
                timeout: Duration::from_millis(settings.health.timeout_ms),
            }),
            diagnostics: settings.diagnostics.clone(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from(&RealtimeSettings::default())
    }
}
