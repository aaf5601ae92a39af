//! Timestamp helpers.
//!
//! Producer timestamps (`t`) are day fractions counted from the charting
//! platform's epoch (1899-12-30 00:00 UTC), so `t * 86400.0` is seconds
//! since that epoch. The engine treats `t` as an opaque ordered float and
//! only converts for logs and summaries.

use chrono::{DateTime, TimeZone, Utc};

/// Unix timestamp of the charting platform's epoch (1899-12-30 00:00 UTC).
pub const SIERRA_EPOCH_UNIX_SECS: i64 = -2_209_161_600;

/// Seconds in one day.
const SECS_PER_DAY: f64 = 86_400.0;

/// Convert a day-fraction timestamp to Unix seconds.
#[inline]
pub fn to_unix_seconds(t: f64) -> f64 {
    t * SECS_PER_DAY + SIERRA_EPOCH_UNIX_SECS as f64
}

/// Convert a day-fraction timestamp to seconds since the platform epoch.
#[inline]
pub fn to_epoch_seconds(t: f64) -> f64 {
    t * SECS_PER_DAY
}

/// Convert a day-fraction timestamp to UTC for display.
///
/// Returns `None` for values outside chrono's representable range.
pub fn day_fraction_to_utc(t: f64) -> Option<DateTime<Utc>> {
    let unix = to_unix_seconds(t);
    if !unix.is_finite() {
        return None;
    }
    let secs = unix.floor() as i64;
    let nanos = ((unix - unix.floor()) * 1e9) as u32;
    Utc.timestamp_opt(secs, nanos).single()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epoch_is_1899() {
        let dt = day_fraction_to_utc(0.0).unwrap();
        assert_eq!(dt.to_rfc3339(), "1899-12-30T00:00:00+00:00");
    }

    #[test]
    fn test_known_date() {
        // 2025-09-05 00:00 UTC is 45905 days after the epoch.
        let dt = day_fraction_to_utc(45_905.0).unwrap();
        assert_eq!(dt.format("%Y-%m-%d").to_string(), "2025-09-05");
    }

    #[test]
    fn test_day_fraction_maps_to_time_of_day() {
        let dt = day_fraction_to_utc(45_905.5).unwrap();
        assert_eq!(dt.format("%H:%M:%S").to_string(), "12:00:00");
    }

    #[test]
    fn test_to_epoch_seconds() {
        assert_eq!(to_epoch_seconds(1.0), 86_400.0);
        assert_eq!(to_epoch_seconds(0.5), 43_200.0);
    }
}
