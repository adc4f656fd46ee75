//! Reconnect delays.

use std::time::Duration;

/// Base delay of the first retry.
pub const BASE_DELAY_MS: u64 = 100;

/// Delay before reconnect attempt `attempt` (1-based), capped at `max`.
///
/// Exponential: 100 ms · 2^(attempt − 1). Attempt 0 means "no wait".
pub fn retry_delay(attempt: u32, max: Duration) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    // Shift bounded so the multiplication saturates instead of overflowing.
    let shift = attempt.saturating_sub(1).min(30);
    let delay_ms = BASE_DELAY_MS.saturating_mul(1u64 << shift);
    Duration::from_millis(delay_ms).min(max)
}
