//! Wall-clock time helpers.
//!
//! Expiration instants are absolute wall-clock milliseconds so they
//! survive serialization across restarts and across the replication
//! wire. A monotonic clock would drift from persisted instants.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the Unix epoch.
#[inline]
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Returns true if an optional expiration instant has passed.
#[inline]
pub fn is_past(expire_at: Option<i64>, now: i64) -> bool {
    matches!(expire_at, Some(at) if at <= now)
}
