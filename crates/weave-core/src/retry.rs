//! Retry scheduling with exponential backoff.

use std::time::Duration;

use weave_types::workflow::RetryPolicy;

/// Delay before the next attempt, given the number of attempts already
/// made. The first retry (after attempt 1) waits `base_delay_ms`; each
/// further retry multiplies the delay by `backoff_multiplier`.
pub fn backoff_delay(policy: &RetryPolicy, attempts_made: u32) -> Duration {
    let exponent = attempts_made.saturating_sub(1);
    let multiplier = policy.backoff_multiplier.max(1.0);
    let millis = (policy.base_delay_ms as f64) * multiplier.powi(exponent as i32);
    // Clamp to an hour so a runaway multiplier cannot park an instance.
    Duration::from_millis(millis.min(3_600_000.0) as u64)
}

/// Whether another attempt should be scheduled. A step with
/// `max_retries = N` runs at most `N + 1` times, and only retryable
/// failures are rescheduled.
pub fn should_retry(policy: &RetryPolicy, attempts_made: u32, retryable: bool) -> bool {
    retryable && attempts_made <= policy.max_retries
}
