//! Time helpers shared by the services: millisecond timestamps and retry backoff.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Base delay for the first retry
const BACKOFF_BASE_MS: u64 = 100;

/// Upper bound for any single backoff sleep
const BACKOFF_MAX_MS: u64 = 60_000;

/// Current wall-clock time in milliseconds since the Unix epoch
#[inline]
pub fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Milliseconds elapsed since `since_ms` (saturating)
#[inline]
pub fn elapsed_ms(since_ms: u64) -> u64 {
    current_time_ms().saturating_sub(since_ms)
}

/// Exponential backoff upper bound for a number of consecutive failures
pub fn backoff_ceiling(attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let exp = attempt.min(16);
    let ms = BACKOFF_BASE_MS.saturating_mul(1u64 << exp).min(BACKOFF_MAX_MS);
    Duration::from_millis(ms)
}

/// Full-jitter backoff: uniformly random in `[ceiling/2, ceiling]`
pub fn jittered_backoff(attempt: u32) -> Duration {
    let ceiling = backoff_ceiling(attempt).as_millis() as u64;
    if ceiling == 0 {
        return Duration::ZERO;
    }
    let half = ceiling / 2;
    Duration::from_millis(half + fastrand::u64(0..=half))
}
