//! # tableside-settings
//!
//! Layered configuration for the Tableside realtime client.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`TablesideSettings::default()`]
//! 2. **User file**: `~/.tableside/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `TABLESIDE_*` overrides (highest priority)
//!
//! There is no global instance: callers load once and hand the value to
//! whatever needs it.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, apply_overrides_from, deep_merge, load_settings, load_settings_from_path,
    settings_path,
};
pub use types::*;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_path_under_home_dir() {
        let path = settings_path();
        assert!(path.ends_with(".tableside/settings.json"));
    }

    #[test]
    fn re_exports_work() {
        let settings = TablesideSettings::default();
        assert!(settings.realtime.validate().is_ok());
        let merged = deep_merge(serde_json::json!({"x": 1}), serde_json::json!({"y": 2}));
        assert_eq!(merged["x"], 1);
    }
}
