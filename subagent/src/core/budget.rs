//! Wall-clock budget helpers measured from scope start.

use std::time::{Duration, Instant};

/// Milliseconds elapsed since `start`, saturating at `u64::MAX`.
pub fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Remaining time before `timeout` expires, or `None` once it has.
pub fn remaining_budget(start: Instant, timeout: Duration) -> Option<Duration> {
    let deadline = start.checked_add(timeout)?;
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .unwrap_or(Duration::from_secs(0));
    if remaining.is_zero() {
        return None;
    }
    Some(remaining)
}
