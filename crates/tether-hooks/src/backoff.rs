use std::time::Duration;

use chrono::{DateTime, Utc};

/// Delay before zero-based `attempt`.
///
/// With a delay table the entry for `attempt` is used, plateauing on the last
/// entry once the table runs out. Without one the delay is `2^attempt`
/// seconds, uncapped (saturating at `u64::MAX`).
pub fn delay(attempt: u32, table: &[u64]) -> Duration {
    match table.get(attempt as usize).or_else(|| table.last()) {
        Some(secs) => Duration::from_secs(*secs),
        None => Duration::from_secs(1u64.checked_shl(attempt).unwrap_or(u64::MAX)),
    }
}

/// `now + delay`, saturating at the latest representable instant.
pub fn fire_time(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
