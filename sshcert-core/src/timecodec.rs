//! Conversion of authority timestamps to calendar time.
//!
//! The authority reports validity bounds as whole seconds since the Unix
//! epoch (1970-01-01T00:00:00Z).  Conversion is always to UTC so that the
//! rendered value does not depend on the host time zone.  Inputs outside
//! chrono's representable range (roughly ±262,000 years) clamp to
//! [`DateTime::<Utc>::MIN_UTC`] or [`DateTime::<Utc>::MAX_UTC`].

use chrono::{DateTime, Utc};

/// Render format for persisted timestamps, e.g. `2024-03-01 12:00:00 +0000 UTC`.
pub const RENDER_FORMAT: &str = "%Y-%m-%d %H:%M:%S %z UTC";

pub fn seconds_to_calendar(seconds: i64) -> DateTime<Utc> {
    match DateTime::<Utc>::from_timestamp(seconds, 0) {
        Some(dt) => dt,
        None if seconds < 0 => DateTime::<Utc>::MIN_UTC,
        None => DateTime::<Utc>::MAX_UTC,
    }
}

pub fn render(time: &DateTime<Utc>) -> String {
    time.format(RENDER_FORMAT).to_string()
}

/// Convenience for the common convert-then-render path.
pub fn render_seconds(seconds: i64) -> String {
    render(&seconds_to_calendar(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_renders_in_utc() {
        assert_eq!(render_seconds(0), "1970-01-01 00:00:00 +0000 UTC");
    }

    #[test]
    fn typical_validity_bound() {
        // 2024-03-01T12:00:00Z
        assert_eq!(render_seconds(1_709_294_400), "2024-03-01 12:00:00 +0000 UTC");
    }

    #[test]
    fn negative_seconds_before_epoch() {
        assert_eq!(render_seconds(-86_400), "1969-12-31 00:00:00 +0000 UTC");
    }

    #[test]
    fn out_of_range_clamps_deterministically() {
        assert_eq!(seconds_to_calendar(i64::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(seconds_to_calendar(i64::MIN), DateTime::<Utc>::MIN_UTC);
        assert_eq!(render_seconds(i64::MAX), render_seconds(i64::MAX));
    }
}
