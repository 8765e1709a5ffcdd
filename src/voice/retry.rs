//! Exponential backoff for rate-limited synthesis requests

use std::time::{Duration, SystemTime};

/// Retry policy for synthesis calls rejected with a rate limit
///
/// Attempt `n` (zero-based) waits `base_delay * 2^n` plus a little jitter,
/// never more than `max_delay`. After `max_retries` retries the segment is
/// given up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Base delay between retries (doubles each attempt)
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
        }
    }
}

/// Parse a `Retry-After` header value given in whole seconds
#[must_use]
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Compute the delay before retry `attempt` (zero-based)
///
/// The exponential schedule is a floor: a server-provided `retry_after` can
/// lengthen the wait but never shorten it. Jitter is 0-25% of the scheduled
/// delay, derived from `SystemTime` to avoid pulling in a random number
/// generator.
#[must_use]
pub fn delay_for_attempt(
    policy: &RetryPolicy,
    attempt: u32,
    retry_after: Option<Duration>,
) -> Duration {
    let base = policy
        .base_delay
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(policy.max_delay);

    if let Some(ra) = retry_after {
        if ra > base {
            return ra.min(policy.max_delay);
        }
    }

    let jitter_nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();

    let jitter_fraction = f64::from(jitter_nanos % 250) / 1000.0;
    let jitter = base.mul_f64(jitter_fraction);

    (base + jitter).min(policy.max_delay)
}
