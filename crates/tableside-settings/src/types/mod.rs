//! Settings type definitions.
//!
//! All types use camelCase JSON and `#[serde(default)]`, so a partial file
//! only overrides the keys it names.

mod realtime;

pub use realtime::*;

use serde::{Deserialize, Serialize};

use tableside_core::constants::{NAME, VERSION};
use tableside_core::logging::DEFAULT_LEVEL;

/// Root settings type.
///
/// ```json
/// {
///   "realtime": { "serverUrl": "https://pos.example.com", "heartbeat": { "maxMissed": 5 } },
///   "logging": { "level": "info" }
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TablesideSettings {
    /// Settings schema version.
    pub version: String,
    /// Application name.
    pub name: String,
    /// Realtime connection settings.
    pub realtime: RealtimeSettings,
    /// Logging configuration.
    pub logging: LoggingSettings,
}

impl Default for TablesideSettings {
    fn default() -> Self {
        Self {
            version: VERSION.to_string(),
            name: NAME.to_string(),
            realtime: RealtimeSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

/// Logging configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default `tracing` filter directive; `RUST_LOG` takes precedence.
    pub level: String,
    /// Emit newline-delimited JSON instead of the compact format.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: DEFAULT_LEVEL.to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = TablesideSettings::default();
        assert_eq!(settings.name, "tableside");
        assert_eq!(settings.logging.level, "warn");
        assert!(!settings.logging.json);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let settings: TablesideSettings =
            serde_json::from_str(r#"{"logging": {"level": "debug"}}"#).unwrap();
        assert_eq!(settings.logging.level, "debug");
        assert_eq!(settings.realtime, RealtimeSettings::default());
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(TablesideSettings::default()).unwrap();
        assert!(json["realtime"]["serverUrl"].is_string());
        assert!(json["realtime"]["heartbeat"]["maxMissed"].is_u64());
    }
}
