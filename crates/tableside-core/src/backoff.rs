//! Reconnect backoff configuration and delay calculation.
//!
//! Sync-only building blocks; the timer itself lives in the realtime crate.
//!
//! - [`BackoffPolicy`]: base delay, cap, jitter and attempt ceiling
//! - [`calculate_backoff_delay`]: exponential backoff with upward jitter

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Default reconnect attempt ceiling.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
/// Default base delay in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 1000;
/// Default maximum delay in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
/// Default jitter factor.
pub const DEFAULT_JITTER_FACTOR: f64 = 0.2;
/// Jitter factors are clamped below this so consecutive delays never overlap.
pub const MAX_JITTER_FACTOR: f64 = 0.99;

/// Reconnect backoff parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackoffPolicy {
    /// Failed attempts allowed before giving up.
    pub max_attempts: u32,
    /// Delay before the first retry in ms.
    pub base_delay_ms: u64,
    /// Upper bound for any delay in ms.
    pub max_delay_ms: u64,
    /// Upward jitter as a fraction of the exponential delay (0.0–0.99).
    pub jitter_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (zero-based), using `random` in `[0, 1)`.
    pub fn delay(&self, attempt: u32, random: f64) -> Duration {
        Duration::from_millis(calculate_backoff_delay(
            attempt,
            self.base_delay_ms,
            self.max_delay_ms,
            self.jitter_factor,
            random,
        ))
    }

    /// Whether `attempts` failed retries exhaust the policy.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Backoff calculation
// ─────────────────────────────────────────────────────────────────────────────

/// Calculate exponential backoff delay with upward jitter.
///
/// Formula: `min(max_delay, base_delay * 2^attempt * (1 + random * jitter))`
///
/// Jitter only ever lengthens the delay and is clamped below 1.0, so for a
/// doubling base the result is non-decreasing in `attempt` and never exceeds
/// `max_delay_ms`.
///
/// * `attempt`: zero-based attempt index (0 for first retry)
/// * `random`: value in `[0.0, 1.0)` from a PRNG; out-of-range values are clamped
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn calculate_backoff_delay(
    attempt: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    jitter_factor: f64,
    random: f64,
) -> u64 {
    let exponential = base_delay_ms.saturating_mul(1u64 << attempt.min(31));
    if exponential >= max_delay_ms {
        return max_delay_ms;
    }

    let jitter = jitter_factor.clamp(0.0, MAX_JITTER_FACTOR) * random.clamp(0.0, 1.0);
    let with_jitter = (exponential as f64) * (1.0 + jitter);

    (with_jitter.round() as u64).min(max_delay_ms)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
