//! Reconnection scheduling.
//!
//! [`ReconnectionScheduler`] is the bookkeeping half of reconnection: the
//! attempt counter, the backoff policy and the single pending timer token.
//! The manager owns the timer task itself and asks the scheduler for the
//! delay and the token that cancels it.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use tableside_core::backoff::BackoffPolicy;

/// Attempt counter plus at most one armed timer.
#[derive(Debug)]
pub struct ReconnectionScheduler {
    policy: BackoffPolicy,
    attempts: u32,
    pending: Option<CancellationToken>,
}

impl ReconnectionScheduler {
    /// Create a scheduler with no failures recorded.
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            pending: None,
        }
    }

    /// Failed attempts since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record a failed attempt. Returns the new count.
    pub fn record_failure(&mut self) -> u32 {
        self.attempts = self.attempts.saturating_add(1);
        self.attempts
    }

    /// Whether the attempt ceiling is reached.
    pub fn is_exhausted(&self) -> bool {
        self.policy.is_exhausted(self.attempts)
    }

    /// Zero the counter and cancel any armed timer.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.cancel_pending();
    }

    /// Delay before the next attempt.
    pub fn next_delay(&self) -> Duration {
        self.delay_with(rand::random::<f64>())
    }

    /// Delay before the next attempt for a given random draw in `[0, 1)`.
    pub fn delay_with(&self, random: f64) -> Duration {
        self.policy.delay(self.attempts, random)
    }

    /// Arm a new timer. Any previous timer is cancelled first, so at most
    /// one is ever pending. The returned token is a child of `parent`.
    pub fn arm(&mut self, parent: &CancellationToken) -> CancellationToken {
        self.cancel_pending();
        let token = parent.child_token();
        self.pending = Some(token.clone());
        token
    }

    /// Forget the armed timer without cancelling it (it has fired).
    pub fn clear_pending(&mut self) {
        self.pending = None;
    }

    /// Whether a timer is armed and not cancelled.
    pub fn has_pending(&self) -> bool {
        self.pending.as_ref().is_some_and(|t| !t.is_cancelled())
    }

    /// Cancel the armed timer, if any.
    pub fn cancel_pending(&mut self) {
        if let Some(token) = self.pending.take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts,
            base_delay_ms: 100,
            max_delay_ms: 1000,
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn counts_until_exhausted() {
        let mut scheduler = ReconnectionScheduler::new(policy(2));
        assert!(!scheduler.is_exhausted());
        assert_eq!(scheduler.record_failure(), 1);
        assert!(!scheduler.is_exhausted());
        assert_eq!(scheduler.record_failure(), 2);
        assert!(scheduler.is_exhausted());
    }

    #[test]
    fn zero_ceiling_is_immediately_exhausted() {
        assert!(ReconnectionScheduler::new(policy(0)).is_exhausted());
    }

    #[test]
    fn delay_grows_with_attempts() {
        let mut scheduler = ReconnectionScheduler::new(policy(10));
        assert_eq!(scheduler.delay_with(0.5), Duration::from_millis(100));
        let _ = scheduler.record_failure();
        assert_eq!(scheduler.delay_with(0.5), Duration::from_millis(200));
        for _ in 0..8 {
            let _ = scheduler.record_failure();
        }
        assert_eq!(scheduler.delay_with(0.5), Duration::from_millis(1000));
    }

    #[test]
    fn arming_cancels_previous_timer() {
        let parent = CancellationToken::new();
        let mut scheduler = ReconnectionScheduler::new(policy(3));
        let first = scheduler.arm(&parent);
        let second = scheduler.arm(&parent);
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert!(scheduler.has_pending());
    }

    #[test]
    fn reset_clears_counter_and_timer() {
        let parent = CancellationToken::new();
        let mut scheduler = ReconnectionScheduler::new(policy(3));
        let _ = scheduler.record_failure();
        let timer = scheduler.arm(&parent);
        scheduler.reset();
        assert_eq!(scheduler.attempts(), 0);
        assert!(timer.is_cancelled());
        assert!(!scheduler.has_pending());
    }

    #[test]
    fn parent_cancellation_reaches_timer() {
        let parent = CancellationToken::new();
        let mut scheduler = ReconnectionScheduler::new(policy(3));
        let timer = scheduler.arm(&parent);
        parent.cancel();
        assert!(timer.is_cancelled());
        assert!(!scheduler.has_pending());
    }

    #[test]
    fn clear_pending_leaves_token_alive() {
        let parent = CancellationToken::new();
        let mut scheduler = ReconnectionScheduler::new(policy(3));
        let timer = scheduler.arm(&parent);
        scheduler.clear_pending();
        assert!(!timer.is_cancelled());
        assert!(!scheduler.has_pending());
    }
}
