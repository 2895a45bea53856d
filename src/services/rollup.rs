//! Hourly rollup: summarize the twelve 5-minute buckets of one hour into a
//! single long-term row.
//!
//! Mean/min/max aggregate across the hour; sum, state and last_reset are
//! cumulative, so only the final short-term observation of the hour matters.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgConnection;
use std::collections::BTreeMap;

use crate::model::StatValues;

#[derive(Debug, sqlx::FromRow)]
struct HourlyMeanRow {
    metadata_id: i64,
    mean: Option<f64>,
    min: Option<f64>,
    max: Option<f64>,
}

#[derive(Debug, sqlx::FromRow)]
struct HourlySumRow {
    metadata_id: i64,
    last_reset: Option<DateTime<Utc>>,
    state: Option<f64>,
    sum: Option<f64>,
}

/// Union of the aggregate half and the latest-row half. A series present in
/// only one half still gets an hourly row, with the other half's fields
/// absent.
fn merge_hourly_summary(
    hour_start: DateTime<Utc>,
    means: Vec<HourlyMeanRow>,
    sums: Vec<HourlySumRow>,
) -> BTreeMap<i64, StatValues> {
    let mut summary: BTreeMap<i64, StatValues> = BTreeMap::new();

    for row in means {
        let stat = summary
            .entry(row.metadata_id)
            .or_insert_with(|| StatValues::empty(hour_start));
        stat.mean = row.mean;
        stat.min = row.min;
        stat.max = row.max;
    }

    for row in sums {
        let stat = summary
            .entry(row.metadata_id)
            .or_insert_with(|| StatValues::empty(hour_start));
        stat.last_reset = row.last_reset;
        stat.state = row.state;
        stat.sum = row.sum;
    }

    summary
}

/// Roll up `[hour_start, hour_start + 1h)` into the long-term table. Runs
/// inside the caller's transaction; returns the number of rows written.
pub async fn compile_hourly_statistics(
    conn: &mut PgConnection,
    hour_start: DateTime<Utc>,
) -> Result<usize> {
    let hour_end = hour_start + Duration::hours(1);

    let means: Vec<HourlyMeanRow> = sqlx::query_as(
        r#"
        SELECT metadata_id, AVG(mean) AS mean, MIN(min) AS min, MAX(max) AS max
        FROM statistics_short_term
        WHERE start >= $1 AND start < $2
        GROUP BY metadata_id
        ORDER BY metadata_id
        "#,
    )
    .bind(hour_start)
    .bind(hour_end)
    .fetch_all(&mut *conn)
    .await
    .context("failed to summarize hourly means")?;

    let sums: Vec<HourlySumRow> = sqlx::query_as(
        r#"
        SELECT DISTINCT ON (metadata_id) metadata_id, last_reset, state, sum
        FROM statistics_short_term
        WHERE start >= $1 AND start < $2
        ORDER BY metadata_id, start DESC
        "#,
    )
    .bind(hour_start)
    .bind(hour_end)
    .fetch_all(&mut *conn)
    .await
    .context("failed to summarize hourly sums")?;

    let summary = merge_hourly_summary(hour_start, means, sums);
    let row_count = summary.len();

    for (metadata_id, stat) in summary {
        let result = sqlx::query(
            r#"
            INSERT INTO statistics (metadata_id, start, mean, min, max, last_reset, state, sum)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (metadata_id, start) DO NOTHING
            "#,
        )
        .bind(metadata_id)
        .bind(stat.start)
        .bind(stat.mean)
        .bind(stat.min)
        .bind(stat.max)
        .bind(stat.last_reset)
        .bind(stat.state)
        .bind(stat.sum)
        .execute(&mut *conn)
        .await
        .context("failed to insert hourly statistics")?;

        if result.rows_affected() == 0 {
            tracing::warn!(
                metadata_id,
                start = %stat.start,
                "blocked attempt to insert duplicated hourly statistics row"
            );
        }
    }

    if row_count > 0 {
        tracing::debug!(rows = row_count, hour = %hour_start, "compiled hourly statistics");
    }
    Ok(row_count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn hour() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 10, 0, 0).unwrap()
    }

    #[test]
    fn merges_mean_and_sum_halves_for_one_series() {
        let means = vec![HourlyMeanRow {
            metadata_id: 7,
            mean: Some(6.5),
            min: Some(1.0),
            max: Some(12.0),
        }];
        let sums = vec![HourlySumRow {
            metadata_id: 7,
            last_reset: None,
            state: Some(118.0),
            sum: Some(58.0),
        }];

        let summary = merge_hourly_summary(hour(), means, sums);
        let stat = summary.get(&7).unwrap();
        assert_eq!(stat.start, hour());
        assert_eq!(stat.mean, Some(6.5));
        assert_eq!(stat.min, Some(1.0));
        assert_eq!(stat.max, Some(12.0));
        assert_eq!(stat.state, Some(118.0));
        assert_eq!(stat.sum, Some(58.0));
    }

    #[test]
    fn sum_only_series_still_gets_a_row() {
        let sums = vec![HourlySumRow {
            metadata_id: 3,
            last_reset: Some(hour()),
            state: Some(10.0),
            sum: Some(55.0),
        }];

        let summary = merge_hourly_summary(hour(), Vec::new(), sums);
        let stat = summary.get(&3).unwrap();
        assert_eq!(stat.mean, None);
        assert_eq!(stat.min, None);
        assert_eq!(stat.max, None);
        assert_eq!(stat.sum, Some(55.0));
        assert_eq!(stat.last_reset, Some(hour()));
    }

    #[test]
    fn mean_only_series_keeps_sum_fields_absent() {
        let means = vec![HourlyMeanRow {
            metadata_id: 5,
            mean: Some(21.0),
            min: Some(20.0),
            max: Some(22.0),
        }];

        let summary = merge_hourly_summary(hour(), means, Vec::new());
        let stat = summary.get(&5).unwrap();
        assert_eq!(stat.mean, Some(21.0));
        assert_eq!(stat.sum, None);
        assert_eq!(stat.state, None);
        assert_eq!(stat.last_reset, None);
    }

    #[test]
    fn distinct_series_stay_separate() {
        let means = vec![
            HourlyMeanRow {
                metadata_id: 1,
                mean: Some(1.0),
                min: Some(0.0),
                max: Some(2.0),
            },
            HourlyMeanRow {
                metadata_id: 2,
                mean: Some(9.0),
                min: Some(8.0),
                max: Some(10.0),
            },
        ];
        let sums = vec![HourlySumRow {
            metadata_id: 2,
            last_reset: None,
            state: Some(4.0),
            sum: Some(4.0),
        }];

        let summary = merge_hourly_summary(hour(), means, sums);
        assert_eq!(summary.len(), 2);
        assert_eq!(summary.get(&1).unwrap().sum, None);
        assert_eq!(summary.get(&2).unwrap().mean, Some(9.0));
        assert_eq!(summary.get(&2).unwrap().sum, Some(4.0));
    }
}
