//! Builder Retry Policy
//!
//! Exponential backoff for transient builder failures.
//!
//! ```text
//! backoff = min(base * multiplier^attempt, cap)
//!
//! Defaults (100ms base, 2x multiplier, 5s cap, 5 attempts):
//! - Attempt 1: immediate
//! - Attempt 2: wait 100ms
//! - Attempt 3: wait 200ms
//! - Attempt 4: wait 400ms
//! - Attempt 5: wait 800ms
//! - then: promote to permanent
//! ```
//!
//! Jitter (±25%) prevents a thundering herd when several workers hit the
//! same contended resource and back off in lockstep.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts against the same record before promotion to permanent
    /// (R_MAX_BUILDER).
    pub max_attempts: u32,
    /// Initial backoff duration.
    pub base: Duration,
    /// Backoff multiplier for exponential growth.
    pub multiplier: f64,
    /// Maximum backoff duration.
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base: Duration::from_millis(100),
            multiplier: 2.0,
            cap: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (0-indexed).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let millis = self.base.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        Duration::from_millis(millis as u64).min(self.cap)
    }

    /// Backoff with ±25% jitter.
    pub fn jittered_backoff(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        let jitter = 0.75 + rand::random::<f64>() * 0.5;
        Duration::from_millis((base.as_millis() as f64 * jitter) as u64)
    }
}
