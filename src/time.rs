//! Bucket alignment and local-calendar helpers.
//!
//! Short-term buckets are 5 minutes and hourly buckets are UTC-aligned, but
//! day and month boundaries are calendar concepts evaluated in the consumer's
//! time zone. DST transitions make some local midnights ambiguous or
//! nonexistent; [`local_instant`] resolves those the same way for every
//! caller so period bounds stay stable.

use chrono::{DateTime, Datelike, Duration, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

pub const SHORT_TERM_PERIOD_SECONDS: i64 = 300;

/// Start of the most recently completed 5-minute period.
pub fn previous_period(now: DateTime<Utc>) -> DateTime<Utc> {
    period_start(now) - Duration::seconds(SHORT_TERM_PERIOD_SECONDS)
}

/// Floor an instant to its 5-minute boundary.
pub fn period_start(ts: DateTime<Utc>) -> DateTime<Utc> {
    let epoch = ts
        .timestamp()
        .div_euclid(SHORT_TERM_PERIOD_SECONDS)
        * SHORT_TERM_PERIOD_SECONDS;
    Utc.timestamp_opt(epoch, 0).single().unwrap_or(ts)
}

/// Floor an instant to its hour boundary.
pub fn hour_start(ts: DateTime<Utc>) -> DateTime<Utc> {
    let epoch = ts.timestamp().div_euclid(3600) * 3600;
    Utc.timestamp_opt(epoch, 0).single().unwrap_or(ts)
}

/// True when a short-term period starts exactly on an hour boundary, which
/// means the previous hour `[H-1, H)` is complete and ready to roll up.
pub fn starts_hour(period_start: DateTime<Utc>) -> bool {
    period_start.minute() == 0
}

/// True when an instant sits exactly on an hour boundary.
pub fn is_hour_aligned(ts: DateTime<Utc>) -> bool {
    ts.minute() == 0 && ts.second() == 0 && ts.timestamp_subsec_nanos() == 0
}

/// Resolve a naive local datetime to UTC. Ambiguous local times (DST fold)
/// resolve to the earlier instance; nonexistent local times (DST gap) shift
/// forward to the next valid local minute.
pub fn local_instant(tz: Tz, naive: NaiveDateTime) -> DateTime<Utc> {
    const SEARCH_MINUTES: i64 = 180;

    match tz.from_local_datetime(&naive) {
        chrono::LocalResult::Single(dt) => return dt.with_timezone(&Utc),
        chrono::LocalResult::Ambiguous(a, b) => {
            let (a, b) = (a.with_timezone(&Utc), b.with_timezone(&Utc));
            return a.min(b);
        }
        chrono::LocalResult::None => {}
    }

    for minutes in 1..=SEARCH_MINUTES {
        let candidate = naive + Duration::minutes(minutes);
        match tz.from_local_datetime(&candidate) {
            chrono::LocalResult::Single(dt) => return dt.with_timezone(&Utc),
            chrono::LocalResult::Ambiguous(a, b) => {
                let (a, b) = (a.with_timezone(&Utc), b.with_timezone(&Utc));
                return a.min(b);
            }
            chrono::LocalResult::None => continue,
        }
    }

    // Unreachable for real time zones; fall back to interpreting as UTC.
    Utc.from_utc_datetime(&naive)
}

pub fn same_day(tz: Tz, t1: DateTime<Utc>, t2: DateTime<Utc>) -> bool {
    t1.with_timezone(&tz).date_naive() == t2.with_timezone(&tz).date_naive()
}

/// Start and end of the local calendar day containing `ts`, in UTC.
pub fn day_bounds(tz: Tz, ts: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let date = ts.with_timezone(&tz).date_naive();
    let start = local_instant(tz, date.and_hms_opt(0, 0, 0).expect("midnight"));
    let end = local_instant(
        tz,
        (date + Duration::days(1)).and_hms_opt(0, 0, 0).expect("midnight"),
    );
    (start, end)
}

pub fn same_month(tz: Tz, t1: DateTime<Utc>, t2: DateTime<Utc>) -> bool {
    let d1 = t1.with_timezone(&tz).date_naive();
    let d2 = t2.with_timezone(&tz).date_naive();
    (d1.year(), d1.month()) == (d2.year(), d2.month())
}

/// Start and end of the local calendar month containing `ts`, in UTC.
pub fn month_bounds(tz: Tz, ts: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let date = ts.with_timezone(&tz).date_naive();
    let first = date.with_day(1).expect("first of month");
    let next_first = if first.month() == 12 {
        first
            .with_year(first.year() + 1)
            .and_then(|d| d.with_month(1))
            .expect("january")
    } else {
        first.with_month(first.month() + 1).expect("next month")
    };
    let start = local_instant(tz, first.and_hms_opt(0, 0, 0).expect("midnight"));
    let end = local_instant(tz, next_first.and_hms_opt(0, 0, 0).expect("midnight"));
    (start, end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn floors_to_five_minute_boundaries() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 10, 17, 42).unwrap();
        assert_eq!(
            period_start(ts),
            Utc.with_ymd_and_hms(2026, 3, 1, 10, 15, 0).unwrap()
        );
        let aligned = Utc.with_ymd_and_hms(2026, 3, 1, 10, 15, 0).unwrap();
        assert_eq!(period_start(aligned), aligned);
    }

    #[test]
    fn previous_period_steps_back_one_slot() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 10, 2, 30).unwrap();
        assert_eq!(
            previous_period(now),
            Utc.with_ymd_and_hms(2026, 3, 1, 9, 55, 0).unwrap()
        );
    }

    #[test]
    fn starts_hour_only_on_boundary_slot() {
        assert!(starts_hour(Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap()));
        assert!(!starts_hour(
            Utc.with_ymd_and_hms(2026, 3, 1, 10, 55, 0).unwrap()
        ));
        assert!(!starts_hour(
            Utc.with_ymd_and_hms(2026, 3, 1, 10, 5, 0).unwrap()
        ));
    }

    #[test]
    fn hour_alignment_check() {
        assert!(is_hour_aligned(
            Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap()
        ));
        assert!(!is_hour_aligned(
            Utc.with_ymd_and_hms(2026, 3, 1, 10, 5, 0).unwrap()
        ));
        assert!(!is_hour_aligned(
            Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 1).unwrap()
        ));
    }

    #[test]
    fn day_bounds_span_23_hours_on_spring_forward() {
        let tz = chrono_tz::US::Eastern;
        // 2026-03-08: US DST starts, 02:00 local does not exist.
        let inside = Utc.with_ymd_and_hms(2026, 3, 8, 18, 0, 0).unwrap();
        let (start, end) = day_bounds(tz, inside);
        assert_eq!(end - start, Duration::hours(23));
    }

    #[test]
    fn day_bounds_span_25_hours_on_fall_back() {
        let tz = chrono_tz::US::Eastern;
        // 2026-11-01: US DST ends, 01:00-02:00 local repeats.
        let inside = Utc.with_ymd_and_hms(2026, 11, 1, 18, 0, 0).unwrap();
        let (start, end) = day_bounds(tz, inside);
        assert_eq!(end - start, Duration::hours(25));
    }

    #[test]
    fn nonexistent_local_midnight_shifts_forward() {
        // Chile DST starts 2026-09-06: midnight local does not exist, the day
        // starts at 01:00 local.
        let tz = chrono_tz::America::Santiago;
        let naive = NaiveDate::from_ymd_opt(2026, 9, 6)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let resolved = local_instant(tz, naive);
        let local = resolved.with_timezone(&tz);
        assert_eq!(local.hour(), 1);
        assert_eq!(local.date_naive(), NaiveDate::from_ymd_opt(2026, 9, 6).unwrap());
    }

    #[test]
    fn month_bounds_roll_over_year_end() {
        let tz = chrono_tz::UTC;
        let inside = Utc.with_ymd_and_hms(2026, 12, 15, 12, 0, 0).unwrap();
        let (start, end) = month_bounds(tz, inside);
        assert_eq!(start, Utc.with_ymd_and_hms(2026, 12, 1, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn same_day_and_month_use_local_calendar() {
        let tz = chrono_tz::US::Eastern;
        // 03:00 UTC is still the previous local day in Eastern time.
        let late = Utc.with_ymd_and_hms(2026, 6, 2, 3, 0, 0).unwrap();
        let earlier = Utc.with_ymd_and_hms(2026, 6, 1, 20, 0, 0).unwrap();
        assert!(same_day(tz, late, earlier));
        assert!(same_month(tz, late, earlier));

        let next_month_utc = Utc.with_ymd_and_hms(2026, 7, 1, 2, 0, 0).unwrap();
        assert!(same_month(tz, next_month_utc, late));
    }
}
