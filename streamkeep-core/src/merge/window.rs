use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// Seconds between two merge windows.
pub const WINDOW_PERIOD_SECS: i64 = 30 * 60;

/// The first `:00` or `:30` UTC boundary strictly after `now`.
pub fn next_window_after(now: DateTime<Utc>) -> DateTime<Utc> {
    let next = now.timestamp().div_euclid(WINDOW_PERIOD_SECS) * WINDOW_PERIOD_SECS
        + WINDOW_PERIOD_SECS;
    DateTime::<Utc>::from_timestamp(next, 0)
        .unwrap_or_else(|| now + TimeDelta::seconds(WINDOW_PERIOD_SECS))
}

/// Wall-clock distance from `now` to `window`, zero if already past.
pub fn until(now: DateTime<Utc>, window: DateTime<Utc>) -> Duration {
    (window - now).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, s).unwrap()
    }

    #[test]
    fn picks_the_next_half_hour() {
        assert_eq!(next_window_after(at(12, 0, 1)), at(12, 30, 0));
        assert_eq!(next_window_after(at(12, 29, 59)), at(12, 30, 0));
        assert_eq!(next_window_after(at(12, 31, 0)), at(13, 0, 0));
        assert_eq!(
            next_window_after(at(23, 45, 0)),
            Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn a_boundary_is_not_after_itself() {
        assert_eq!(next_window_after(at(12, 30, 0)), at(13, 0, 0));
        let just_after = at(12, 30, 0) + TimeDelta::milliseconds(1);
        assert_eq!(next_window_after(just_after), at(13, 0, 0));
    }

    #[test]
    fn waits_until_the_boundary() {
        assert_eq!(next_window_after(at(7, 10, 3)), at(7, 30, 0));
        assert_eq!(until(at(7, 29, 0), at(7, 30, 0)), Duration::from_secs(60));
        assert_eq!(until(at(7, 31, 0), at(7, 30, 0)), Duration::ZERO);
    }
}
