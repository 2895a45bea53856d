//! Read-time reduction of hourly statistics into daily or monthly buckets.
//!
//! A plain fold over one series' hourly rows, already sorted by start.
//! Periods are calendar concepts in the consumer's time zone. Reduced rows
//! are never persisted.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;

use crate::model::StatisticPoint;
use crate::time;

fn mean_of(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

fn min_of(values: &[f64]) -> Option<f64> {
    values.iter().copied().reduce(f64::min)
}

fn max_of(values: &[f64]) -> Option<f64> {
    values.iter().copied().reduce(f64::max)
}

/// Reduce one series' hourly rows into coarser periods. `same_period` decides
/// whether two instants share a period and `period_bounds` returns a period's
/// absolute start/end; `period` sizes the sentinel entry that closes the
/// final accumulator.
pub fn reduce_statistics(
    rows: &[StatisticPoint],
    same_period: impl Fn(DateTime<Utc>, DateTime<Utc>) -> bool,
    period_bounds: impl Fn(DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>),
    period: Duration,
) -> Vec<StatisticPoint> {
    let Some(last) = rows.last() else {
        return Vec::new();
    };
    let sentinel_start = last.start + period;

    let mut result: Vec<StatisticPoint> = Vec::new();
    let mut mean_values: Vec<f64> = Vec::new();
    let mut min_values: Vec<f64> = Vec::new();
    let mut max_values: Vec<f64> = Vec::new();
    let mut prev = &rows[0];

    for entry in rows
        .iter()
        .map(Some)
        .chain(std::iter::once(None))
    {
        let entry_start = entry.map_or(sentinel_start, |row| row.start);

        if !same_period(prev.start, entry_start) {
            // The previous row was the last entry of its period.
            let (start, end) = period_bounds(prev.start);
            result.push(StatisticPoint {
                start,
                end,
                mean: mean_of(&mean_values),
                min: min_of(&min_values),
                max: max_of(&max_values),
                last_reset: prev.last_reset,
                state: prev.state,
                sum: prev.sum,
            });
            mean_values.clear();
            min_values.clear();
            max_values.clear();
        }

        if let Some(row) = entry {
            if let Some(value) = row.mean {
                mean_values.push(value);
            }
            if let Some(value) = row.min {
                min_values.push(value);
            }
            if let Some(value) = row.max {
                max_values.push(value);
            }
            prev = row;
        }
    }

    result
}

pub fn reduce_statistics_per_day(tz: Tz, rows: &[StatisticPoint]) -> Vec<StatisticPoint> {
    reduce_statistics(
        rows,
        |t1, t2| time::same_day(tz, t1, t2),
        |t| time::day_bounds(tz, t),
        Duration::days(1),
    )
}

pub fn reduce_statistics_per_month(tz: Tz, rows: &[StatisticPoint]) -> Vec<StatisticPoint> {
    reduce_statistics(
        rows,
        |t1, t2| time::same_month(tz, t1, t2),
        |t| time::month_bounds(tz, t),
        Duration::days(31),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn hourly(start: DateTime<Utc>, mean: f64, sum: f64) -> StatisticPoint {
        StatisticPoint {
            start,
            end: start + Duration::hours(1),
            mean: Some(mean),
            min: Some(mean - 1.0),
            max: Some(10.0),
            last_reset: None,
            state: Some(mean * 2.0),
            sum: Some(sum),
        }
    }

    #[test]
    fn one_local_day_reduces_to_one_row() {
        let tz = chrono_tz::UTC;
        let day = Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap();
        let rows: Vec<StatisticPoint> = (0..24)
            .map(|h| hourly(day + Duration::hours(h), h as f64, h as f64 * 2.0))
            .collect();

        let reduced = reduce_statistics_per_day(tz, &rows);
        assert_eq!(reduced.len(), 1);
        let row = &reduced[0];
        assert_eq!(row.start, day);
        assert_eq!(row.end, day + Duration::days(1));
        assert_eq!(row.max, Some(10.0));
        assert_eq!(row.mean, Some(11.5)); // mean of 0..=23
        assert_eq!(row.min, Some(-1.0));
        // Cumulative fields come from the final hourly row.
        assert_eq!(row.sum, Some(46.0));
        assert_eq!(row.state, Some(46.0));
    }

    #[test]
    fn month_boundary_yields_two_monthly_rows() {
        let tz = chrono_tz::UTC;
        let start = Utc.with_ymd_and_hms(2026, 5, 31, 20, 0, 0).unwrap();
        // Eight hourly rows: four in May, four in June.
        let rows: Vec<StatisticPoint> = (0..8)
            .map(|h| hourly(start + Duration::hours(h), 1.0, h as f64))
            .collect();

        let reduced = reduce_statistics_per_month(tz, &rows);
        assert_eq!(reduced.len(), 2);
        assert_eq!(reduced[0].start, Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap());
        assert_eq!(reduced[0].end, Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap());
        assert_eq!(reduced[0].sum, Some(3.0));
        assert_eq!(reduced[1].start, Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap());
        assert_eq!(reduced[1].end, Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).unwrap());
        assert_eq!(reduced[1].sum, Some(7.0));
    }

    #[test]
    fn day_boundaries_follow_the_local_calendar() {
        let tz = chrono_tz::US::Eastern;
        // 2026-06-01 22:00 local through 2026-06-02 02:00 local.
        let start = Utc.with_ymd_and_hms(2026, 6, 2, 2, 0, 0).unwrap();
        let rows: Vec<StatisticPoint> = (0..5)
            .map(|h| hourly(start + Duration::hours(h), 1.0, h as f64))
            .collect();

        let reduced = reduce_statistics_per_day(tz, &rows);
        assert_eq!(reduced.len(), 2);
        // First local day ends at 2026-06-02 00:00 local == 04:00 UTC.
        assert_eq!(
            reduced[0].end,
            Utc.with_ymd_and_hms(2026, 6, 2, 4, 0, 0).unwrap()
        );
        assert_eq!(reduced[0].sum, Some(1.0));
        assert_eq!(reduced[1].sum, Some(4.0));
    }

    #[test]
    fn rows_without_mean_are_ignored_in_aggregates() {
        let tz = chrono_tz::UTC;
        let day = Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap();
        let mut rows = vec![hourly(day, 4.0, 1.0)];
        rows.push(StatisticPoint {
            start: day + Duration::hours(1),
            end: day + Duration::hours(2),
            mean: None,
            min: None,
            max: None,
            last_reset: Some(day),
            state: Some(7.0),
            sum: Some(9.0),
        });

        let reduced = reduce_statistics_per_day(tz, &rows);
        assert_eq!(reduced.len(), 1);
        assert_eq!(reduced[0].mean, Some(4.0));
        assert_eq!(reduced[0].max, Some(10.0));
        assert_eq!(reduced[0].sum, Some(9.0));
        assert_eq!(reduced[0].last_reset, Some(day));
    }

    #[test]
    fn empty_input_reduces_to_nothing() {
        assert!(reduce_statistics_per_day(chrono_tz::UTC, &[]).is_empty());
    }
}
