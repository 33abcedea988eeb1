//! Absolute/relative timestamp helpers shared by the task queue and the
//! scheduler.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Timestamps older than this many seconds since the epoch are treated as
/// relative offsets from "now" rather than absolute wall-clock times.
///
/// `10 * 365 * 86_400` seconds: a `t` argument smaller than this is a
/// relative offset, larger is an absolute wall-clock timestamp.
pub const RELATIVE_CUTOFF_SECS: f64 = 10.0 * 365.0 * 86_400.0;

/// Returns the current wall-clock time as fractional seconds since
/// `UNIX_EPOCH`.
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before UNIX_EPOCH")
        .as_secs_f64()
}

/// Resolves a scalar `after` time: values smaller than the relative cutoff
/// are interpreted as an offset from "now"; larger values are taken as an
/// absolute timestamp already.
pub fn resolve_after(after: f64) -> f64 {
    if after < RELATIVE_CUTOFF_SECS {
        now_secs() + after
    } else {
        after
    }
}

/// Converts a `Duration` timeout into an absolute deadline, or `None` for
/// "wait forever".
pub fn deadline_from(timeout: Option<Duration>) -> Option<f64> {
    timeout.map(|d| now_secs() + d.as_secs_f64())
}

/// Remaining time until `deadline`, clamped to zero, or `None` if there is
/// no deadline (wait forever).
pub fn remaining(deadline: Option<f64>) -> Option<Duration> {
    deadline.map(|t| {
        let left = t - now_secs();
        if left <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(left)
        }
    })
}

/// Whether `deadline` has already passed.
pub fn past(deadline: Option<f64>) -> bool {
    match deadline {
        Some(t) => now_secs() >= t,
        None => false,
    }
}
