//! Wall-clock helpers shared by sessions and the KCP clock.

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch. Returns 0 if the clock is before the epoch.
#[inline]
pub fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// 32-bit millisecond clock for KCP. Wraps around, which KCP tolerates.
#[inline]
pub fn kcp_clock() -> u32 {
    (current_time_millis() & 0xFFFF_FFFF) as u32
}

/// Milliseconds elapsed since `since`, saturating at zero.
#[inline]
pub fn elapsed_millis(since: u64) -> u64 {
    current_time_millis().saturating_sub(since)
}
