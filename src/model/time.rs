//! Wall-clock and duration rendering for the wire schema.

use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;

const NANOS_PER_MICRO: i64 = 1_000;
const MICROS_PER_SECOND: i64 = 1_000_000;
const SECONDS_PER_MINUTE: i64 = 60;
const MINUTES_PER_HOUR: i64 = 60;
const HOURS_PER_DAY: i64 = 24;

/// Durations on the wire are non-negative.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("negative duration: {nanos}ns")]
pub struct NegativeDuration {
    /// The offending value.
    pub nanos: i64,
}

/// Renders an instant as ISO-8601 UTC with microsecond precision and an
/// explicit `+00:00` offset, e.g. `2020-01-01T12:00:00.123456+00:00`.
pub fn format_instant(epoch_nanos: i64) -> String {
    let instant: DateTime<Utc> = DateTime::from_timestamp_nanos(epoch_nanos);
    instant.to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// Renders a duration as `DD.HH:MM:SS.ffffff`, truncating to microseconds.
///
/// Days widen past two digits when needed; the other fields are fixed
/// width and zero padded.
pub fn format_duration(nanos: i64) -> Result<String, NegativeDuration> {
    if nanos < 0 {
        return Err(NegativeDuration { nanos });
    }
    let total_micros = nanos / NANOS_PER_MICRO;
    let micros = total_micros % MICROS_PER_SECOND;
    let total_seconds = total_micros / MICROS_PER_SECOND;
    let seconds = total_seconds % SECONDS_PER_MINUTE;
    let total_minutes = total_seconds / SECONDS_PER_MINUTE;
    let minutes = total_minutes % MINUTES_PER_HOUR;
    let total_hours = total_minutes / MINUTES_PER_HOUR;
    let hours = total_hours % HOURS_PER_DAY;
    let days = total_hours / HOURS_PER_DAY;

    Ok(format!(
        "{days:02}.{hours:02}:{minutes:02}:{seconds:02}.{micros:06}"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instant_has_micros_and_utc_offset() {
        // 2020-01-01T00:00:00.123456Z
        let nanos = 1_577_836_800_123_456_000i64;
        assert_eq!(format_instant(nanos), "2020-01-01T00:00:00.123456+00:00");
    }

    #[test]
    fn instant_zero_fraction_keeps_six_digits() {
        let nanos = 1_577_836_800_000_000_000i64;
        assert_eq!(format_instant(nanos), "2020-01-01T00:00:00.000000+00:00");
    }

    fn get_duration_test_data() -> Vec<(i64, &'static str)> {
        vec![
            (0, "00.00:00:00.000000"),
            (150_000_000, "00.00:00:00.150000"),
            (1_000, "00.00:00:00.000001"),
            (999, "00.00:00:00.000000"),
            (61_000_000_000, "00.00:01:01.000000"),
            (3_661_000_000_000, "00.01:01:01.000000"),
            (90_061_000_000_000, "01.01:01:01.000000"),
            (86_400_000_000_000 * 123, "123.00:00:00.000000"),
        ]
    }

    #[test]
    fn duration_fields_are_zero_padded() {
        for (nanos, expected) in get_duration_test_data() {
            assert_eq!(format_duration(nanos).unwrap(), expected, "nanos {nanos}");
        }
    }

    #[test]
    fn negative_duration_is_rejected() {
        assert_eq!(format_duration(-1), Err(NegativeDuration { nanos: -1 }));
    }

    /// Inverse of `format_duration`, used to check the round trip only.
    fn parse_duration(formatted: &str) -> i64 {
        let (days, rest) = formatted.split_once('.').unwrap();
        let (clock, micros) = rest.rsplit_once('.').unwrap();
        let mut parts = clock.split(':');
        let hours: i64 = parts.next().unwrap().parse().unwrap();
        let minutes: i64 = parts.next().unwrap().parse().unwrap();
        let seconds: i64 = parts.next().unwrap().parse().unwrap();
        let days: i64 = days.parse().unwrap();
        let micros: i64 = micros.parse().unwrap();
        ((((days * 24 + hours) * 60 + minutes) * 60 + seconds) * 1_000_000 + micros) * 1_000
    }

    #[test]
    fn duration_round_trips_at_microsecond_precision() {
        for nanos in [0i64, 1_000, 150_000_000, 86_400_000_000_000, 7_203_000_123_000] {
            let formatted = format_duration(nanos).unwrap();
            assert_eq!(parse_duration(&formatted), nanos, "via {formatted}");
        }
    }
}
