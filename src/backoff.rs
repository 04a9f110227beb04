//! Retry Backoff
//!
//! Exponential delay shared by the offline drain and realtime reconnects.

use std::time::Duration;

/// First retry delay.
pub const BASE_DELAY_MS: u64 = 1_000;
/// Upper bound on any single delay.
pub const MAX_DELAY_MS: u64 = 30_000;

/// `min(1000 * 2^attempt, 30000)` milliseconds.
pub fn backoff_delay(attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    Duration::from_millis(BASE_DELAY_MS.saturating_mul(factor).min(MAX_DELAY_MS))
}
