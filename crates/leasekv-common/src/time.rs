//! Wall clock helpers
//!
//! Lease deadlines are absolute seconds since the Unix epoch so that
//! every process sharing a store compares against the same reference.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current time in fractional seconds since the Unix epoch
pub fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Convert a settings value in seconds into a `Duration`.
///
/// Negative, NaN, infinite and out-of-range inputs are treated as "no
/// duration" and return `None`.
pub fn secs_to_duration(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs).ok()
}
