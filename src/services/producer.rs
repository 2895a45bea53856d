//! Statistics producers and their registry.
//!
//! Producers are registered objects with explicit optional capabilities:
//! compiling a window of samples, announcing the series ids they will
//! produce, and validating their own inputs. The compiler and the query
//! entry points discover capabilities through the accessor methods instead
//! of probing attributes at runtime.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;

use crate::model::{valid_series_id, CompiledSeries, CompiledStatistics, SeriesDescriptor, StatValues};
use crate::services::metadata::{self, MetadataFilter};

pub const SAMPLE_KIND_MEASUREMENT: &str = "measurement";
pub const SAMPLE_KIND_COUNTER: &str = "counter";

/// Source tag for series compiled from the local samples table.
pub const RECORDER_SOURCE: &str = "recorder";

#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct ValidationIssue {
    #[serde(rename = "type")]
    pub issue_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub series_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

pub trait CompileStatistics: Send + Sync {
    /// Compile statistics for `[range_start, range_end)`. Read-only; the
    /// caller persists the result inside its own transactional scope.
    fn compile<'a>(
        &'a self,
        db: &'a PgPool,
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<CompiledStatistics>>;
}

pub trait ListSeriesIds: Send + Sync {
    /// Series this producer will emit in upcoming compilation periods.
    fn list_series_ids<'a>(&'a self, db: &'a PgPool) -> BoxFuture<'a, Result<Vec<SeriesDescriptor>>>;
}

pub trait ValidateStatistics: Send + Sync {
    fn validate<'a>(&'a self, db: &'a PgPool) -> BoxFuture<'a, Result<Vec<ValidationIssue>>>;
}

pub trait StatisticsProducer: Send + Sync {
    fn name(&self) -> &str;

    fn compiler(&self) -> Option<&dyn CompileStatistics> {
        None
    }

    fn series_lister(&self) -> Option<&dyn ListSeriesIds> {
        None
    }

    fn validator(&self) -> Option<&dyn ValidateStatistics> {
        None
    }
}

/// Explicit producer registry, passed into each unit of work instead of
/// living in process-global state.
#[derive(Default, Clone)]
pub struct ProducerRegistry {
    producers: Vec<Arc<dyn StatisticsProducer>>,
}

impl ProducerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, producer: Arc<dyn StatisticsProducer>) {
        self.producers.push(producer);
    }

    pub fn producers(&self) -> &[Arc<dyn StatisticsProducer>] {
        &self.producers
    }
}

/// The built-in producer: compiles raw rows from the `samples` table.
/// Measurement series get mean/min/max; counter series carry their raw
/// cumulative reading as `state` and a reset-aware running total as `sum`.
pub struct SamplerProducer;

#[derive(sqlx::FromRow)]
struct SampleAggregateRow {
    series_id: String,
    mean: Option<f64>,
    min: Option<f64>,
    max: Option<f64>,
}

#[derive(sqlx::FromRow)]
struct SampleLatestRow {
    series_id: String,
    kind: String,
    unit: Option<String>,
    display_name: Option<String>,
}

#[derive(sqlx::FromRow)]
struct CounterReadingRow {
    series_id: String,
    ts: DateTime<Utc>,
    value: f64,
}

#[derive(sqlx::FromRow)]
struct PreviousTotalRow {
    series_id: String,
    state: Option<f64>,
    sum: Option<f64>,
    last_reset: Option<DateTime<Utc>>,
}

/// Fold a window of cumulative counter readings onto the previous period's
/// running total. A reading below its predecessor is a counter reset: the
/// reading itself is the contribution and `last_reset` moves forward.
fn accumulate_counter(
    prev_state: Option<f64>,
    prev_sum: Option<f64>,
    prev_last_reset: Option<DateTime<Utc>>,
    readings: &[(DateTime<Utc>, f64)],
) -> (Option<f64>, Option<f64>, Option<DateTime<Utc>>) {
    let mut state = prev_state;
    let mut sum = prev_sum.unwrap_or(0.0);
    let mut last_reset = prev_last_reset;

    for (ts, value) in readings {
        match state {
            None => {
                // First ever reading is the baseline; nothing accumulated yet.
            }
            Some(prev) if *value < prev => {
                sum += *value;
                last_reset = Some(*ts);
            }
            Some(prev) => {
                sum += *value - prev;
            }
        }
        state = Some(*value);
    }

    (state, Some(sum), last_reset)
}

impl StatisticsProducer for SamplerProducer {
    fn name(&self) -> &str {
        "sampler"
    }

    fn compiler(&self) -> Option<&dyn CompileStatistics> {
        Some(self)
    }

    fn series_lister(&self) -> Option<&dyn ListSeriesIds> {
        Some(self)
    }

    fn validator(&self) -> Option<&dyn ValidateStatistics> {
        Some(self)
    }
}

impl CompileStatistics for SamplerProducer {
    fn compile<'a>(
        &'a self,
        db: &'a PgPool,
        range_start: DateTime<Utc>,
        range_end: DateTime<Utc>,
    ) -> BoxFuture<'a, Result<CompiledStatistics>> {
        Box::pin(async move {
            // Newest sample per series carries the descriptor attributes.
            let latest: Vec<SampleLatestRow> = sqlx::query_as(
                r#"
                SELECT DISTINCT ON (series_id) series_id, kind, unit, display_name
                FROM samples
                WHERE ts >= $1 AND ts < $2
                ORDER BY series_id, ts DESC
                "#,
            )
            .bind(range_start)
            .bind(range_end)
            .fetch_all(db)
            .await
            .context("failed to read sample descriptors")?;

            if latest.is_empty() {
                return Ok(CompiledStatistics::default());
            }

            let aggregates: Vec<SampleAggregateRow> = sqlx::query_as(
                r#"
                SELECT series_id, AVG(value) AS mean, MIN(value) AS min, MAX(value) AS max
                FROM samples
                WHERE ts >= $1 AND ts < $2 AND kind = $3
                GROUP BY series_id
                "#,
            )
            .bind(range_start)
            .bind(range_end)
            .bind(SAMPLE_KIND_MEASUREMENT)
            .fetch_all(db)
            .await
            .context("failed to aggregate measurement samples")?;
            let aggregates: HashMap<String, SampleAggregateRow> = aggregates
                .into_iter()
                .map(|row| (row.series_id.clone(), row))
                .collect();

            let counter_readings: Vec<CounterReadingRow> = sqlx::query_as(
                r#"
                SELECT series_id, ts, value
                FROM samples
                WHERE ts >= $1 AND ts < $2 AND kind = $3
                ORDER BY series_id, ts
                "#,
            )
            .bind(range_start)
            .bind(range_end)
            .bind(SAMPLE_KIND_COUNTER)
            .fetch_all(db)
            .await
            .context("failed to read counter samples")?;
            let mut readings_by_series: HashMap<String, Vec<(DateTime<Utc>, f64)>> = HashMap::new();
            for row in counter_readings {
                readings_by_series
                    .entry(row.series_id)
                    .or_default()
                    .push((row.ts, row.value));
            }

            let series_ids: Vec<String> = latest.iter().map(|row| row.series_id.clone()).collect();

            // Running totals continue from the newest short-term row.
            let previous: Vec<PreviousTotalRow> = sqlx::query_as(
                r#"
                SELECT m.series_id, s.state, s.sum, s.last_reset
                FROM statistics_short_term s
                JOIN (
                    SELECT metadata_id, MAX(start) AS start_max
                    FROM statistics_short_term
                    GROUP BY metadata_id
                ) ls ON ls.metadata_id = s.metadata_id AND ls.start_max = s.start
                JOIN statistics_meta m ON m.id = s.metadata_id
                WHERE m.source = $1 AND m.series_id = ANY($2)
                "#,
            )
            .bind(RECORDER_SOURCE)
            .bind(&series_ids)
            .fetch_all(db)
            .await
            .context("failed to read previous counter totals")?;
            let previous: HashMap<String, PreviousTotalRow> = previous
                .into_iter()
                .map(|row| (row.series_id.clone(), row))
                .collect();

            let metadata = metadata::get_metadata(
                db,
                &MetadataFilter {
                    series_ids: Some(series_ids),
                    source: Some(RECORDER_SOURCE.to_string()),
                    ..Default::default()
                },
            )
            .await?;

            let mut stats = Vec::with_capacity(latest.len());
            for row in latest {
                let is_counter = row.kind == SAMPLE_KIND_COUNTER;
                let descriptor = SeriesDescriptor {
                    series_id: row.series_id.clone(),
                    source: RECORDER_SOURCE.to_string(),
                    unit: row.unit,
                    has_mean: !is_counter,
                    has_sum: is_counter,
                    display_name: row.display_name,
                };

                let mut stat = StatValues::empty(range_start);
                if is_counter {
                    let readings = readings_by_series
                        .remove(&row.series_id)
                        .unwrap_or_default();
                    let prev = previous.get(&row.series_id);
                    let (state, sum, last_reset) = accumulate_counter(
                        prev.and_then(|p| p.state),
                        prev.and_then(|p| p.sum),
                        prev.and_then(|p| p.last_reset),
                        &readings,
                    );
                    stat.state = state;
                    stat.sum = sum;
                    stat.last_reset = last_reset;
                } else if let Some(agg) = aggregates.get(&row.series_id) {
                    stat.mean = agg.mean;
                    stat.min = agg.min;
                    stat.max = agg.max;
                }

                stats.push(CompiledSeries { descriptor, stat });
            }

            Ok(CompiledStatistics { stats, metadata })
        })
    }
}

impl ListSeriesIds for SamplerProducer {
    fn list_series_ids<'a>(&'a self, db: &'a PgPool) -> BoxFuture<'a, Result<Vec<SeriesDescriptor>>> {
        Box::pin(async move {
            let rows: Vec<SampleLatestRow> = sqlx::query_as(
                r#"
                SELECT DISTINCT ON (series_id) series_id, kind, unit, display_name
                FROM samples
                ORDER BY series_id, ts DESC
                "#,
            )
            .fetch_all(db)
            .await
            .context("failed to list sampled series")?;

            Ok(rows
                .into_iter()
                .map(|row| {
                    let is_counter = row.kind == SAMPLE_KIND_COUNTER;
                    SeriesDescriptor {
                        series_id: row.series_id,
                        source: RECORDER_SOURCE.to_string(),
                        unit: row.unit,
                        has_mean: !is_counter,
                        has_sum: is_counter,
                        display_name: row.display_name,
                    }
                })
                .collect())
        })
    }
}

impl ValidateStatistics for SamplerProducer {
    fn validate<'a>(&'a self, db: &'a PgPool) -> BoxFuture<'a, Result<Vec<ValidationIssue>>> {
        Box::pin(async move {
            let mut issues = Vec::new();

            let series: Vec<(String,)> =
                sqlx::query_as("SELECT DISTINCT series_id FROM samples")
                    .fetch_all(db)
                    .await
                    .context("failed to list sampled series ids")?;
            for (series_id,) in &series {
                if !valid_series_id(series_id) {
                    issues.push(ValidationIssue {
                        issue_type: "invalid_series_id".to_string(),
                        series_id: Some(series_id.clone()),
                        detail: None,
                    });
                }
            }

            let mixed_units: Vec<(String, i64)> = sqlx::query_as(
                r#"
                SELECT series_id, COUNT(DISTINCT COALESCE(unit, '')) AS units
                FROM samples
                GROUP BY series_id
                HAVING COUNT(DISTINCT COALESCE(unit, '')) > 1
                "#,
            )
            .fetch_all(db)
            .await
            .context("failed to check sample units")?;
            for (series_id, units) in mixed_units {
                issues.push(ValidationIssue {
                    issue_type: "inconsistent_unit".to_string(),
                    series_id: Some(series_id),
                    detail: Some(format!("{units} distinct units observed")),
                });
            }

            Ok(issues)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 10, minute, 0).unwrap()
    }

    #[test]
    fn counter_accumulates_deltas_onto_previous_total() {
        let readings = vec![(ts(0), 105.0), (ts(1), 110.0), (ts(4), 118.0)];
        let (state, sum, last_reset) =
            accumulate_counter(Some(100.0), Some(40.0), None, &readings);
        assert_eq!(state, Some(118.0));
        assert_eq!(sum, Some(58.0)); // 40 + 5 + 5 + 8
        assert_eq!(last_reset, None);
    }

    #[test]
    fn counter_reset_contributes_new_reading_and_marks_reset() {
        let readings = vec![(ts(0), 105.0), (ts(2), 3.0), (ts(4), 10.0)];
        let (state, sum, last_reset) =
            accumulate_counter(Some(100.0), Some(40.0), None, &readings);
        assert_eq!(state, Some(10.0));
        assert_eq!(sum, Some(55.0)); // 40 + 5, reset to 3, + 7
        assert_eq!(last_reset, Some(ts(2)));
    }

    #[test]
    fn first_reading_is_baseline_only() {
        let readings = vec![(ts(0), 50.0), (ts(3), 60.0)];
        let (state, sum, last_reset) = accumulate_counter(None, None, None, &readings);
        assert_eq!(state, Some(60.0));
        assert_eq!(sum, Some(10.0));
        assert_eq!(last_reset, None);
    }

    #[test]
    fn empty_window_preserves_previous_totals() {
        let (state, sum, last_reset) =
            accumulate_counter(Some(100.0), Some(40.0), Some(ts(0)), &[]);
        assert_eq!(state, Some(100.0));
        assert_eq!(sum, Some(40.0));
        assert_eq!(last_reset, Some(ts(0)));
    }

    #[test]
    fn sampler_exposes_all_capabilities() {
        let producer = SamplerProducer;
        assert!(producer.compiler().is_some());
        assert!(producer.series_lister().is_some());
        assert!(producer.validator().is_some());
        assert_eq!(producer.name(), "sampler");
    }
}
