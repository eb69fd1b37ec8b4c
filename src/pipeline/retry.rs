//! Bounded exponential backoff shared by the AI and delivery retry loops.

use std::time::Duration;

use rand::Rng;

/// Attempt ceiling plus backoff curve.
///
/// `max_attempts` counts the first try, so `3` means one call and two retries.
/// The delay before retry `n` (1-based) is `base_delay * 2^(n-1)`, capped at
/// `max_delay`, plus up to 10% random jitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            jitter: true,
        }
    }

    /// No waiting between attempts (for tests).
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Deterministic part of the delay after a failed `attempt` (1-based).
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let scaled = self.base_delay.saturating_mul(1u32 << exp);
        scaled.min(self.max_delay)
    }

    /// Delay to sleep after a failed `attempt`, honouring a server hint up to the cap.
    pub fn backoff(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let base = self.base_backoff(attempt);
        let base = match hint {
            Some(hint) => hint.min(self.max_delay).max(base),
            None => base,
        };
        if !self.jitter || base.is_zero() {
            return base;
        }
        let max_jitter_ms = (base.as_millis() / 10) as u64;
        if max_jitter_ms == 0 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0..=max_jitter_ms);
        base + Duration::from_millis(jitter)
    }

    /// Whether another attempt is allowed after `attempt` failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500), Duration::from_secs(8))
    }
}
