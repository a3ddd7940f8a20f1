//! Retry/backoff policy shared by the dispatch client's internal retry loop
//! and the engine's outer queue-driven retry, parameterized independently.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Explicit backoff policy: bounded attempts, exponential delay with a cap,
/// and proportional jitter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempt budget, including the first attempt.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    /// Delay multiplier per attempt; 2.0 doubles.
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Jitter fraction in `[0, 1)`; the computed delay is scaled by a random
    /// factor in `[1 - jitter, 1 + jitter]`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 250,
            multiplier: 2.0,
            max_delay_ms: 10_000,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before retry number `attempt` (0-based: the delay after
    /// the first failure is `delay_for_attempt(0)`), jittered.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.min(32) as i32);
        let raw = (self.base_delay_ms as f64 * exp).min(self.max_delay_ms as f64);
        let jittered = if self.jitter > 0.0 {
            let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
            raw * factor
        } else {
            raw
        };
        Duration::from_millis(jittered.max(0.0) as u64)
    }
}

/// Mutable retry bookkeeping for one logical operation.
#[derive(Debug)]
pub struct RetryContext {
    policy: RetryPolicy,
    /// Attempts consumed so far (the first attempt counts as 1 once made).
    pub attempt: u32,
    pub last_error: Option<String>,
}

impl RetryContext {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempt: 1,
            last_error: None,
        }
    }

    /// Record a failure. Returns the backoff delay before the next attempt,
    /// or `None` when the attempt budget is exhausted.
    pub fn next_attempt(&mut self, error: Option<String>) -> Option<Duration> {
        self.last_error = error;
        if self.attempt >= self.policy.max_attempts {
            return None;
        }
        let delay = self.policy.delay_for_attempt(self.attempt - 1);
        self.attempt += 1;
        Some(delay)
    }

    pub fn success(&mut self) {
        self.last_error = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(policy: RetryPolicy) -> RetryPolicy {
        RetryPolicy {
            jitter: 0.0,
            ..policy
        }
    }

    #[test]
    fn delay_doubles_per_attempt_up_to_the_cap() {
        let policy = no_jitter(RetryPolicy {
            base_delay_ms: 100,
            max_delay_ms: 500,
            ..RetryPolicy::default()
        });
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(500));
    }

    #[test]
    fn jitter_keeps_delay_within_bounds() {
        let policy = RetryPolicy {
            base_delay_ms: 1_000,
            jitter: 0.2,
            ..RetryPolicy::default()
        };
        for _ in 0..50 {
            let delay = policy.delay_for_attempt(0).as_millis() as u64;
            assert!((800..=1_200).contains(&delay), "delay {} out of bounds", delay);
        }
    }

    #[test]
    fn context_exhausts_after_max_attempts() {
        let mut ctx = RetryContext::new(no_jitter(RetryPolicy {
            max_attempts: 3,
            ..RetryPolicy::default()
        }));
        assert!(ctx.next_attempt(Some("first".into())).is_some());
        assert!(ctx.next_attempt(Some("second".into())).is_some());
        assert!(ctx.next_attempt(Some("third".into())).is_none());
        assert_eq!(ctx.attempt, 3);
        assert_eq!(ctx.last_error.as_deref(), Some("third"));
    }

    #[test]
    fn single_attempt_policy_never_retries() {
        let mut ctx = RetryContext::new(RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        });
        assert!(ctx.next_attempt(None).is_none());
    }
}
