//! Wall-clock helpers and hour-offset arithmetic.
//!
//! Despawn times recur every hour, so most scheduling math works on offsets
//! in `[0, 3600)` relative to the top of the current hour.

use std::time::Duration;

pub const HOUR: i64 = 3600;

/// Current Unix time in fractional seconds.
pub fn now() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Current Unix time in whole seconds.
pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Start of the hour containing `ts`.
pub fn current_hour(ts: i64) -> i64 {
    ts - ts.rem_euclid(HOUR)
}

/// Offset of `ts` within its hour.
pub fn hour_offset(ts: i64) -> i64 {
    ts.rem_euclid(HOUR)
}

/// Seconds from the reference offset until `seconds` next comes around,
/// wrapping across the hour boundary in either direction.
pub fn time_until_time(seconds: i64, reference: i64) -> i64 {
    if reference > seconds {
        seconds + HOUR - reference
    } else if reference + HOUR < seconds {
        seconds - HOUR - reference
    } else {
        seconds - reference
    }
}

/// Longest wait any helper here returns.
pub const MAX_WAIT: Duration = Duration::from_secs(7 * 24 * HOUR as u64);

/// Duration until the given Unix timestamp, zero if it already passed.
pub fn until(ts: f64) -> Duration {
    secs(ts - now())
}

/// Duration from fractional seconds. Negatives and NaN become zero, anything
/// beyond `MAX_WAIT` (infinity included) becomes `MAX_WAIT`.
pub fn secs(value: f64) -> Duration {
    if value.is_nan() || value <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(value).map_or(MAX_WAIT, |d| d.min(MAX_WAIT))
}
