//! Time-zone-correct date-key and bucket utilities.
//!
//! All operations here are pure: given an instant and a zone they always
//! return the same result, and none of them touch the settings store, the
//! network, or the clock except through the instant the caller supplies.

use std::sync::Mutex;

use chrono::{DateTime, Duration, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

static WARNED_ZONES: Mutex<Vec<String>> = Mutex::new(Vec::new());

/// Resolves an IANA zone name, falling back to UTC and logging a one-shot
/// warning per distinct bad zone string.
///
/// # Arguments
///
/// * 'zone' - IANA time zone name, e.g. "Europe/Oslo"
fn resolve_zone(zone: &str) -> Tz {
    match zone.parse::<Tz>() {
        Ok(tz) => tz,
        Err(_) => {
            let mut warned = WARNED_ZONES.lock().unwrap();
            if !warned.iter().any(|z| z == zone) {
                log::warn!("unknown time zone '{}', falling back to UTC", zone);
                warned.push(zone.to_string());
            }
            chrono_tz::UTC
        }
    }
}

/// Returns the local date-key (YYYY-MM-DD) for an instant in a given zone.
///
/// # Arguments
///
/// * 'instant' - the instant to derive a date-key for
/// * 'zone' - IANA time zone name
pub fn date_key(instant: DateTime<Utc>, zone: &str) -> String {
    let tz = resolve_zone(zone);
    instant.with_timezone(&tz).format("%Y-%m-%d").to_string()
}

/// Returns the first UTC instant of a given local date-key in a given zone.
///
/// Handles DST gaps (a date-key whose midnight falls in a spring-forward
/// gap) and overlaps (falls back on the earlier of the two midnights) by
/// always resolving to the earliest valid instant - "falling forward".
///
/// # Arguments
///
/// * 'key' - a YYYY-MM-DD date-key
/// * 'zone' - IANA time zone name
pub fn day_start(key: &str, zone: &str) -> Result<DateTime<Utc>, TimeError> {
    let tz = resolve_zone(zone);
    let naive_date = chrono::NaiveDate::parse_from_str(key, "%Y-%m-%d")
        .map_err(|e| TimeError::BadDateKey(format!("{}: {}", key, e)))?;
    let naive_midnight = naive_date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| TimeError::BadDateKey(key.to_string()))?;

    let local = match tz.from_local_datetime(&naive_midnight) {
        chrono::LocalResult::Single(dt) => dt,
        chrono::LocalResult::Ambiguous(earliest, _latest) => earliest,
        chrono::LocalResult::None => {
            // Spring-forward gap: fall forward minute by minute until a
            // valid local instant is found, bounded to avoid looping forever
            // on a malformed zone table.
            let mut probe = naive_midnight;
            let mut found = None;
            for _ in 0..180 {
                probe += Duration::minutes(1);
                if let chrono::LocalResult::Single(dt) = tz.from_local_datetime(&probe) {
                    found = Some(dt);
                    break;
                }
            }
            found.ok_or_else(|| TimeError::DstGapUnresolved(key.to_string()))?
        }
    };

    Ok(local.with_timezone(&Utc))
}

/// Returns the UTC instant of the next day's boundary, surviving DST by
/// adding 26 hours and re-deriving the date-key/day-start rather than
/// assuming a fixed 24h offset.
///
/// # Arguments
///
/// * 'today_start' - the UTC instant returned by `day_start` for today
/// * 'zone' - IANA time zone name
pub fn next_day_start(today_start: DateTime<Utc>, zone: &str) -> Result<DateTime<Utc>, TimeError> {
    let probe = today_start + Duration::hours(26);
    let next_key = date_key(probe, zone);
    day_start(&next_key, zone)
}

/// Returns the UTC instant of the top of the clock-hour containing `instant`,
/// in the given zone.
///
/// # Arguments
///
/// * 'instant' - instant to truncate
/// * 'zone' - IANA time zone name
pub fn top_of_hour(instant: DateTime<Utc>, zone: &str) -> DateTime<Utc> {
    let tz = resolve_zone(zone);
    let local = instant.with_timezone(&tz);
    let truncated = local
        .date_naive()
        .and_hms_opt(local.hour(), 0, 0)
        .unwrap_or_else(|| local.date_naive().and_hms_opt(0, 0, 0).unwrap());

    match tz.from_local_datetime(&truncated) {
        chrono::LocalResult::Single(dt) => dt.with_timezone(&Utc),
        chrono::LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        chrono::LocalResult::None => instant,
    }
}

/// Returns the ordered list of UTC top-of-hour bucket starts for the local
/// day identified by `key` - 23, 24, or 25 entries depending on DST.
///
/// # Arguments
///
/// * 'key' - a YYYY-MM-DD date-key
/// * 'zone' - IANA time zone name
pub fn day_buckets(key: &str, zone: &str) -> Result<Vec<DateTime<Utc>>, TimeError> {
    let start = day_start(key, zone)?;
    let end = next_day_start(start, zone)?;

    let mut buckets = Vec::new();
    let mut cursor = start;
    while cursor < end {
        buckets.push(cursor);
        cursor += Duration::hours(1);
    }
    Ok(buckets)
}

/// Returns the local wall-clock hour (0-23) of an instant in a given zone,
/// used by grace-window decisions (e.g. the tomorrow-prices log-level
/// switch at local 13:00) that must not be confused with the instant's UTC
/// hour.
///
/// # Arguments
///
/// * 'instant' - the instant to derive an hour for
/// * 'zone' - IANA time zone name
pub fn local_hour(instant: DateTime<Utc>, zone: &str) -> u32 {
    let tz = resolve_zone(zone);
    instant.with_timezone(&tz).hour()
}

/// Returns the `weekday_hour` key used by the power tracker's
/// `hourlyAverages` profile map, e.g. "Mon_14".
///
/// # Arguments
///
/// * 'instant' - instant to derive the key for
/// * 'zone' - IANA time zone name
pub fn weekday_hour_key(instant: DateTime<Utc>, zone: &str) -> String {
    let tz = resolve_zone(zone);
    let local = instant.with_timezone(&tz);
    format!("{}_{:02}", local.format("%a"), local.format("%H"))
}

#[derive(Debug, thiserror::Error)]
pub enum TimeError {
    #[error("invalid date key: {0}")]
    BadDateKey(String),
    #[error("could not resolve DST gap for date key: {0}")]
    DstGapUnresolved(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_key_round_trips_through_day_start() {
        let start = day_start("2025-06-01", "Europe/Oslo").unwrap();
        assert_eq!(date_key(start, "Europe/Oslo"), "2025-06-01");
    }

    #[test]
    fn unknown_zone_falls_back_to_utc() {
        let start = day_start("2025-06-01", "Not/AZone").unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn dst_spring_forward_day_has_23_buckets() {
        // Europe/Oslo springs forward on 2025-03-30.
        let buckets = day_buckets("2025-03-30", "Europe/Oslo").unwrap();
        assert_eq!(buckets.len(), 23);
    }

    #[test]
    fn dst_fall_back_day_has_25_buckets() {
        // Europe/Oslo falls back on 2025-10-26.
        let buckets = day_buckets("2025-10-26", "Europe/Oslo").unwrap();
        assert_eq!(buckets.len(), 25);
    }

    #[test]
    fn ordinary_day_has_24_buckets() {
        let buckets = day_buckets("2025-06-01", "Europe/Oslo").unwrap();
        assert_eq!(buckets.len(), 24);
    }

    #[test]
    fn buckets_are_aligned_to_top_of_hour_utc() {
        let buckets = day_buckets("2025-06-01", "Europe/Oslo").unwrap();
        for b in buckets {
            assert_eq!(b.timestamp() % 3600, 0);
        }
    }

    #[test]
    fn next_day_start_survives_dst() {
        let today = day_start("2025-03-30", "Europe/Oslo").unwrap();
        let tomorrow = next_day_start(today, "Europe/Oslo").unwrap();
        assert_eq!(date_key(tomorrow, "Europe/Oslo"), "2025-03-31");
    }

    #[test]
    fn local_hour_differs_from_utc_hour_across_zone_offset() {
        // 23:30 UTC is 00:30 the next day in Europe/Oslo during winter (UTC+1).
        let t = Utc.with_ymd_and_hms(2025, 1, 10, 23, 30, 0).unwrap();
        assert_eq!(local_hour(t, "Europe/Oslo"), 0);
        assert_eq!(t.hour(), 23);
    }

    #[test]
    fn weekday_hour_key_format() {
        let t = Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap(); // a Monday
        assert_eq!(weekday_hour_key(t, "UTC"), "Mon_12");
    }
}
