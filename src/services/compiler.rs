//! Short-term statistics compiler.
//!
//! One tick compiles the 5-minute period `[start, start + 5min)`: collect
//! from every compile-capable producer, then persist everything in a single
//! transactional scope. A run marker makes the tick idempotent; duplicate
//! bucket inserts from racing writers are swallowed and logged, and the
//! whole persist step is retried on transient store failures.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgConnection;
use std::time::Duration as StdDuration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::db;
use crate::model::{CompiledStatistics, StatValues};
use crate::services::{metadata, rollup};
use crate::state::AppState;
use crate::time;

pub struct StatisticsCompiler {
    state: AppState,
}

impl StatisticsCompiler {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    pub fn start(self, cancel: CancellationToken) {
        let state = self.state;
        let interval = StdDuration::from_secs(state.config.compile_interval_seconds);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let start = time::previous_period(Utc::now());
                        if let Err(err) = compile_statistics(&state, start).await {
                            warn!(start = %start, "statistics compilation failed: {err:#}");
                        }
                    }
                }
            }
        });
    }
}

/// Compile the 5-minute period starting at `start`. Returns true on success,
/// including the no-op case where the period was already compiled.
pub async fn compile_statistics(state: &AppState, start: DateTime<Utc>) -> Result<bool> {
    let start = time::period_start(start);
    let end = start + Duration::seconds(time::SHORT_TERM_PERIOD_SECONDS);

    if run_marker_exists(state, start).await? {
        tracing::debug!(start = %start, end = %end, "statistics already compiled");
        return Ok(true);
    }

    tracing::debug!(start = %start, end = %end, "compiling statistics");

    // Collection is read-only and happens outside the persist transaction.
    let mut compiled = CompiledStatistics::default();
    for producer in state.producers.producers() {
        let Some(compiler) = producer.compiler() else {
            continue;
        };
        let result = compiler
            .compile(&state.db, start, end)
            .await
            .with_context(|| format!("producer {} failed to compile", producer.name()))?;
        tracing::debug!(
            producer = producer.name(),
            series = result.stats.len(),
            start = %start,
            "collected producer statistics"
        );
        compiled.merge(result);
    }

    db::retry_transient("statistics", || async {
        let mut tx = state
            .db
            .begin()
            .await
            .context("failed to begin statistics transaction")?;

        for series in &compiled.stats {
            let metadata_id =
                metadata::resolve_metadata(&mut tx, &series.descriptor, &compiled.metadata).await?;
            insert_short_term_statistics(&mut tx, metadata_id, &series.stat).await?;
        }

        if time::starts_hour(start) {
            // This tick opens a new hour, so the previous one is complete.
            rollup::compile_hourly_statistics(&mut tx, start - Duration::hours(1)).await?;
        }

        let marker = sqlx::query(
            "INSERT INTO statistics_runs (start) VALUES ($1) ON CONFLICT (start) DO NOTHING",
        )
        .bind(start)
        .execute(&mut *tx)
        .await
        .context("failed to insert run marker")?;
        if marker.rows_affected() == 0 {
            warn!(start = %start, "run marker already present, concurrent compilation detected");
        }

        tx.commit()
            .await
            .context("failed to commit statistics transaction")?;
        Ok(())
    })
    .await?;

    Ok(true)
}

async fn run_marker_exists(state: &AppState, start: DateTime<Utc>) -> Result<bool> {
    let row: Option<(DateTime<Utc>,)> =
        sqlx::query_as("SELECT start FROM statistics_runs WHERE start = $1")
            .bind(start)
            .fetch_optional(&state.db)
            .await
            .context("failed to check run marker")?;
    Ok(row.is_some())
}

/// Insert one short-term bucket row. A duplicate at `(metadata_id, start)` is
/// a benign race with another writer: swallowed with a warning, repaired
/// later by the duplicate resolver if it ever slips past the constraint.
async fn insert_short_term_statistics(
    conn: &mut PgConnection,
    metadata_id: i64,
    stat: &StatValues,
) -> Result<()> {
    let result = sqlx::query(
        r#"
        INSERT INTO statistics_short_term
            (metadata_id, start, mean, min, max, last_reset, state, sum)
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
    .execute(conn)
    .await
    .with_context(|| format!("failed to insert short-term statistics for {metadata_id}"))?;

    if result.rows_affected() == 0 {
        warn!(
            metadata_id,
            start = %stat.start,
            "blocked attempt to insert duplicated short-term statistics row"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CompiledSeries, SeriesDescriptor};
    use chrono::TimeZone;

    fn series(series_id: &str) -> CompiledSeries {
        CompiledSeries {
            descriptor: SeriesDescriptor {
                series_id: series_id.to_string(),
                source: "recorder".to_string(),
                unit: None,
                has_mean: true,
                has_sum: false,
                display_name: None,
            },
            stat: StatValues::empty(Utc.with_ymd_and_hms(2026, 5, 1, 10, 0, 0).unwrap()),
        }
    }

    #[test]
    fn producer_results_merge_stats_and_metadata() {
        let mut combined = CompiledStatistics::default();

        let mut first = CompiledStatistics::default();
        first.stats.push(series("sampler:a"));
        first.metadata.insert(
            "sampler:a".to_string(),
            (1, series("sampler:a").descriptor),
        );

        let mut second = CompiledStatistics::default();
        second.stats.push(series("sampler:b"));
        second.metadata.insert(
            "sampler:b".to_string(),
            (2, series("sampler:b").descriptor),
        );

        combined.merge(first);
        combined.merge(second);

        assert_eq!(combined.stats.len(), 2);
        assert_eq!(combined.metadata.len(), 2);
        assert_eq!(combined.metadata.get("sampler:b").unwrap().0, 2);
    }
}
