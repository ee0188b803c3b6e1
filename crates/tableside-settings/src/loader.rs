//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`TablesideSettings::default()`]
//! 2. If `~/.tableside/settings.json` exists, deep-merge user values over defaults
//! 3. Apply `TABLESIDE_*` environment variable overrides (highest priority)
//! 4. Validate cross-field constraints
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tableside_core::TransportKind;
use tracing::debug;

use crate::errors::Result;
use crate::types::TablesideSettings;

/// Resolve the path to the settings file (`~/.tableside/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".tableside").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<TablesideSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// If the file does not exist, returns defaults. If the file contains
/// invalid JSON or the merged values fail validation, returns an error.
pub fn load_settings_from_path(path: &Path) -> Result<TablesideSettings> {
    let defaults = serde_json::to_value(TablesideSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: TablesideSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.realtime.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `TABLESIDE_*` environment variable overrides to loaded settings.
///
/// Invalid values are ignored with a warning (the file/default value stays).
pub fn apply_env_overrides(settings: &mut TablesideSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides using an arbitrary variable lookup.
///
/// Split from [`apply_env_overrides`] so overrides are testable without
/// mutating the process environment.
pub fn apply_overrides_from(
    settings: &mut TablesideSettings,
    lookup: impl Fn(&str) -> Option<String>,
) {
    let rt = &mut settings.realtime;

    if let Some(v) = read_string(&lookup, "TABLESIDE_SERVER_URL") {
        rt.server_url = v;
    }
    if let Some(v) = read_transports(&lookup, "TABLESIDE_TRANSPORTS") {
        rt.transports = v;
    }
    if let Some(v) = read_string(&lookup, "TABLESIDE_AUTH_TOKEN") {
        rt.auth_token = Some(v);
    }
    if let Some(v) = read_u64(&lookup, "TABLESIDE_CONNECT_TIMEOUT_MS", 100, 600_000) {
        rt.connect_timeout_ms = v;
    }
    if let Some(v) = read_u64(&lookup, "TABLESIDE_ACK_TIMEOUT_MS", 100, 600_000) {
        rt.ack_timeout_ms = v;
    }
    if let Some(v) = read_u64(&lookup, "TABLESIDE_HEARTBEAT_INTERVAL_MS", 1000, 600_000) {
        rt.heartbeat.interval_ms = v;
    }
    if let Some(v) = read_u32(&lookup, "TABLESIDE_HEARTBEAT_MAX_MISSED", 1, 100) {
        rt.heartbeat.max_missed = v;
    }
    if let Some(v) = read_u32(&lookup, "TABLESIDE_RECONNECT_MAX_ATTEMPTS", 0, 1000) {
        rt.reconnect.max_attempts = v;
    }
    if let Some(v) = read_bool(&lookup, "TABLESIDE_HEALTH_ENABLED") {
        rt.health.enabled = v;
    }
    if let Some(v) = read_string(&lookup, "TABLESIDE_LOG_LEVEL") {
        settings.logging.level = v;
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u32` within a range.
pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a comma-separated transport list. All entries must be known.
pub fn parse_transport_list(val: &str) -> Option<Vec<TransportKind>> {
    let kinds = val
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<TransportKind>().ok())
        .collect::<Option<Vec<_>>>()?;
    (!kinds.is_empty()).then_some(kinds)
}

// ── Variable readers (thin wrappers) ────────────────────────────────────────

fn read_string(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).filter(|v| !v.is_empty())
}

fn read_bool(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<bool> {
    let val = lookup(name)?;
    let result = parse_bool(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid boolean env var, ignoring");
    }
    result
}

fn read_u32(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    min: u32,
    max: u32,
) -> Option<u32> {
    let val = lookup(name)?;
    let result = parse_u32_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u32 env var, ignoring");
    }
    result
}

fn read_u64(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    min: u64,
    max: u64,
) -> Option<u64> {
    let val = lookup(name)?;
    let result = parse_u64_range(&val, min, max);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid u64 env var, ignoring");
    }
    result
}

fn read_transports(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Option<Vec<TransportKind>> {
    let val = lookup(name)?;
    let result = parse_transport_list(&val);
    if result.is_none() {
        tracing::warn!(key = name, value = %val, "invalid transport list env var, ignoring");
    }
    result
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
