//! Retry decisions and backoff computation for failed step attempts.
//!
//! Stateless: all logic lives in associated functions that take the step's
//! `RetryPolicy` as a parameter. Attempts are 1-based (the first execution is
//! attempt 1). Suspensions are never retried; only failed attempts reach here.

use std::time::Duration;

use stepwise_types::workflow::{RetryPolicy, RetryStrategy};

/// Stateless retry handler for workflow step failures.
pub struct RetryHandler;

impl RetryHandler {
    /// Whether a failed `attempt` should be followed by another one.
    pub fn should_retry(policy: Option<&RetryPolicy>, attempt: u32) -> bool {
        match policy {
            Some(policy) if policy.strategy != RetryStrategy::None => {
                attempt <= policy.max_retries
            }
            _ => false,
        }
    }

    /// Delay to wait after failed `attempt` before the next one.
    pub fn backoff(policy: &RetryPolicy, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let base = policy.delay_ms;
        let millis = match policy.strategy {
            RetryStrategy::None => 0,
            RetryStrategy::FixedDelay => base,
            RetryStrategy::ExponentialBackoff => {
                let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
                base.saturating_mul(factor)
            }
            RetryStrategy::LinearBackoff => base.saturating_mul(u64::from(attempt)),
        };
        Duration::from_millis(millis.min(policy.max_delay_ms))
    }

    /// Total attempts a policy allows, including the first.
    pub fn max_attempts(policy: Option<&RetryPolicy>) -> u32 {
        match policy {
            Some(policy) if policy.strategy != RetryStrategy::None => {
                policy.max_retries.saturating_add(1)
            }
            _ => 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
