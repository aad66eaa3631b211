use std::time::Duration;

use rand::Rng;

/// Exponential backoff with +/-50% jitter, capped at `max`.
///
/// `attempt` is 1-based: the first retry waits roughly `base`.
pub fn backoff_with_jitter(base: Duration, max: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let raw = base.saturating_mul(1u32 << exponent).min(max);
    let jitter = rand::rng().random_range(0.5..1.5);
    let jittered = raw.as_millis() as f64 * jitter;
    Duration::from_millis(jittered as u64).min(max)
}
