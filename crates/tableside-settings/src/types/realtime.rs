//! Realtime connection, heartbeat, reconnect, health and diagnostics settings.

use serde::{Deserialize, Serialize};

use tableside_core::TransportKind;
use tableside_core::backoff::{
    DEFAULT_BASE_DELAY_MS, DEFAULT_JITTER_FACTOR, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY_MS,
};

use crate::errors::{Result, SettingsError};

/// Connection to the backend event hub.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RealtimeSettings {
    /// Base URL of the backend (`http` or `https`).
    pub server_url: String,
    /// Path prefix of the realtime endpoints.
    pub path: String,
    /// Transport preference order, most capable first.
    pub transports: Vec<TransportKind>,
    /// Per-transport open timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Tenant handshake ack timeout in milliseconds.
    pub handshake_timeout_ms: u64,
    /// `emit` ack timeout in milliseconds.
    pub ack_timeout_ms: u64,
    /// Bearer token presented to the backend.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    /// Heartbeat settings.
    pub heartbeat: HeartbeatSettings,
    /// Reconnect backoff settings.
    pub reconnect: ReconnectSettings,
    /// Out-of-band health probe settings.
    pub health: HealthSettings,
    /// Diagnostic ring buffer sizes.
    pub diagnostics: DiagnosticsSettings,
}

impl Default for RealtimeSettings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:3000".to_string(),
            path: "/realtime".to_string(),
            transports: TransportKind::DEFAULT_ORDER.to_vec(),
            connect_timeout_ms: 10_000,
            handshake_timeout_ms: 5_000,
            ack_timeout_ms: 10_000,
            auth_token: None,
            heartbeat: HeartbeatSettings::default(),
            reconnect: ReconnectSettings::default(),
            health: HealthSettings::default(),
            diagnostics: DiagnosticsSettings::default(),
        }
    }
}

impl RealtimeSettings {
    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.transports.is_empty() {
            return Err(SettingsError::InvalidValue(
                "realtime.transports must not be empty".into(),
            ));
        }
        if !self.transports.iter().any(|t| t.is_network()) {
            return Err(SettingsError::InvalidValue(
                "realtime.transports must include a network transport".into(),
            ));
        }
        if !(self.server_url.starts_with("http://") || self.server_url.starts_with("https://")) {
            return Err(SettingsError::InvalidValue(format!(
                "realtime.serverUrl must be an http(s) URL, got '{}'",
                self.server_url
            )));
        }
        if self.heartbeat.timeout_ms >= self.heartbeat.interval_ms {
            return Err(SettingsError::InvalidValue(
                "realtime.heartbeat.timeoutMs must be below intervalMs".into(),
            ));
        }
        if self.heartbeat.max_missed == 0 {
            return Err(SettingsError::InvalidValue(
                "realtime.heartbeat.maxMissed must be at least 1".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.reconnect.jitter_factor) {
            return Err(SettingsError::InvalidValue(
                "realtime.reconnect.jitterFactor must be in [0, 1)".into(),
            ));
        }
        if self.reconnect.base_delay_ms > self.reconnect.max_delay_ms {
            return Err(SettingsError::InvalidValue(
                "realtime.reconnect.baseDelayMs must not exceed maxDelayMs".into(),
            ));
        }
        Ok(())
    }
}

/// Ping/pong liveness checks.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatSettings {
    /// Interval between pings in milliseconds.
    pub interval_ms: u64,
    /// How long to wait for the matching pong in milliseconds.
    pub timeout_ms: u64,
    /// Consecutive misses before the channel is declared dead.
    pub max_missed: u32,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            interval_ms: 25_000,
            timeout_ms: 5_000,
            max_missed: 3,
        }
    }
}

/// Reconnect backoff.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectSettings {
    /// Delay before the first retry in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound for any retry delay in milliseconds.
    pub max_delay_ms: u64,
    /// Upward jitter fraction in `[0, 1)`.
    pub jitter_factor: f64,
    /// Failed retries before the connection is marked failed.
    pub max_attempts: u32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter_factor: DEFAULT_JITTER_FACTOR,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Out-of-band HTTP health probe run after reconnection gives up.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthSettings {
    /// Whether to probe at all.
    pub enabled: bool,
    /// Path of the health endpoint, relative to `serverUrl`.
    pub path: String,
    /// Probe timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "/health".to_string(),
            timeout_ms: 3_000,
        }
    }
}

/// Capacities of the in-memory diagnostic ring buffers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiagnosticsSettings {
    /// Recent delivered notifications.
    pub notification_buffer_size: usize,
    /// Recent transport attempts.
    pub attempt_history_size: usize,
    /// Recent rejected messages.
    pub rejected_buffer_size: usize,
}

impl Default for DiagnosticsSettings {
    fn default() -> Self {
        Self {
            notification_buffer_size: 50,
            attempt_history_size: 100,
            rejected_buffer_size: 50,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = RealtimeSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.transports, TransportKind::DEFAULT_ORDER.to_vec());
        assert_eq!(settings.heartbeat.max_missed, 3);
        assert_eq!(settings.reconnect.max_attempts, 10);
        assert!(settings.health.enabled);
    }

    #[test]
    fn transports_deserialize_from_wire_names() {
        let settings: RealtimeSettings =
            serde_json::from_str(r#"{"transports": ["long-poll", "websocket"]}"#).unwrap();
        assert_eq!(
            settings.transports,
            vec![TransportKind::LongPoll, TransportKind::WebSocket]
        );
    }

    #[test]
    fn empty_transports_invalid() {
        let settings = RealtimeSettings {
            transports: Vec::new(),
            ..RealtimeSettings::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::InvalidValue(_))
        ));
    }

    #[test]
    fn memory_only_transports_invalid() {
        let settings: RealtimeSettings =
            serde_json::from_str(r#"{"transports": ["memory"]}"#).unwrap();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("network transport"));

        let mixed: RealtimeSettings =
            serde_json::from_str(r#"{"transports": ["memory", "long-poll"]}"#).unwrap();
        assert!(mixed.validate().is_ok());
    }

    #[test]
    fn heartbeat_timeout_must_be_shorter_than_interval() {
        let mut settings = RealtimeSettings::default();
        settings.heartbeat.timeout_ms = settings.heartbeat.interval_ms;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn jitter_of_one_is_invalid() {
        let mut settings = RealtimeSettings::default();
        settings.reconnect.jitter_factor = 1.0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn non_http_url_invalid() {
        let settings = RealtimeSettings {
            server_url: "ftp://pos".into(),
            ..RealtimeSettings::default()
        };
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("ftp://pos"));
    }

    #[test]
    fn auth_token_omitted_when_none() {
        let json = serde_json::to_value(RealtimeSettings::default()).unwrap();
        assert!(json.get("authToken").is_none());
    }
}
