//! External statistics importer: hourly statistics supplied by sources
//! outside the sampling pipeline.
//!
//! Input is validated before any write. Unlike the short-term compiler's
//! insert-only path, imports upsert by bucket, because external sources may
//! resend corrected history.

use anyhow::{Context, Result};
use sqlx::postgres::PgConnection;
use sqlx::PgPool;
use tracing::warn;

use crate::db;
use crate::error::WriteError;
use crate::model::{split_series_id, valid_series_id, SeriesDescriptor, StatValues};
use crate::services::metadata::{self, MetadataFilter};
use crate::time;

/// Reject malformed imports before anything is written: the series id must be
/// a valid `<namespace>:<slug>`, the source must own that namespace, and every
/// sample must start exactly on an hour boundary. Timestamps reach this layer
/// as UTC instants, so naive inputs are already impossible by construction.
pub fn validate_external_statistics(
    descriptor: &SeriesDescriptor,
    stats: &[StatValues],
) -> Result<(), WriteError> {
    if !valid_series_id(&descriptor.series_id) {
        return Err(WriteError::Validation(format!(
            "Invalid statistic id {:?}",
            descriptor.series_id
        )));
    }

    let namespace = split_series_id(&descriptor.series_id)
        .map(|(namespace, _)| namespace)
        .unwrap_or_default();
    if descriptor.source.is_empty() || descriptor.source != namespace {
        return Err(WriteError::Validation(format!(
            "Invalid source {:?} for statistic id {:?}",
            descriptor.source, descriptor.series_id
        )));
    }

    for stat in stats {
        if !time::is_hour_aligned(stat.start) {
            return Err(WriteError::Validation(format!(
                "Invalid timestamp {}: external statistics must be aligned to the hour",
                stat.start
            )));
        }
    }

    Ok(())
}

async fn statistics_exists(
    conn: &mut PgConnection,
    metadata_id: i64,
    start: chrono::DateTime<chrono::Utc>,
) -> Result<Option<i64>> {
    let row: Option<(i64,)> =
        sqlx::query_as("SELECT id FROM statistics WHERE metadata_id = $1 AND start = $2")
            .bind(metadata_id)
            .bind(start)
            .fetch_optional(conn)
            .await
            .context("failed to check for existing statistics row")?;
    Ok(row.map(|(id,)| id))
}

async fn update_statistics(
    conn: &mut PgConnection,
    stat_id: i64,
    stat: &StatValues,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE statistics
        SET mean = $2, min = $3, max = $4, last_reset = $5, state = $6, sum = $7
        WHERE id = $1
        "#,
    )
    .bind(stat_id)
    .bind(stat.mean)
    .bind(stat.min)
    .bind(stat.max)
    .bind(stat.last_reset)
    .bind(stat.state)
    .bind(stat.sum)
    .execute(conn)
    .await
    .with_context(|| format!("failed to update statistics row {stat_id}"))?;
    Ok(())
}

async fn insert_statistics(
    conn: &mut PgConnection,
    metadata_id: i64,
    stat: &StatValues,
) -> Result<()> {
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
    .execute(conn)
    .await
    .with_context(|| format!("failed to insert statistics for {metadata_id}"))?;

    if result.rows_affected() == 0 {
        warn!(
            metadata_id,
            start = %stat.start,
            "blocked attempt to insert duplicated statistics row"
        );
    }
    Ok(())
}

/// Validate and merge externally supplied hourly statistics. Existing rows at
/// `(metadata_id, start)` are overwritten in place; the whole batch commits in
/// one transactional scope, retried on transient store failures.
pub async fn add_external_statistics(
    db: &PgPool,
    descriptor: &SeriesDescriptor,
    stats: &[StatValues],
) -> Result<(), WriteError> {
    validate_external_statistics(descriptor, stats)?;

    db::retry_transient("external_statistics", || async {
        let mut tx = db
            .begin()
            .await
            .context("failed to begin external statistics transaction")?;

        let known = metadata::get_metadata_with_conn(
            &mut tx,
            &MetadataFilter {
                series_ids: Some(vec![descriptor.series_id.clone()]),
                ..Default::default()
            },
        )
        .await?;
        let metadata_id = metadata::resolve_metadata(&mut tx, descriptor, &known).await?;

        for stat in stats {
            if let Some(stat_id) = statistics_exists(&mut tx, metadata_id, stat.start).await? {
                update_statistics(&mut tx, stat_id, stat).await?;
            } else {
                insert_statistics(&mut tx, metadata_id, stat).await?;
            }
        }

        tx.commit()
            .await
            .context("failed to commit external statistics transaction")?;
        Ok(())
    })
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn descriptor(series_id: &str, source: &str) -> SeriesDescriptor {
        SeriesDescriptor {
            series_id: series_id.to_string(),
            source: source.to_string(),
            unit: Some("m³".to_string()),
            has_mean: false,
            has_sum: true,
            display_name: Some("Gas meter".to_string()),
        }
    }

    fn stat_at(hour: u32, minute: u32) -> StatValues {
        StatValues::empty(Utc.with_ymd_and_hms(2026, 5, 1, hour, minute, 0).unwrap())
    }

    #[test]
    fn accepts_wellformed_hourly_batch() {
        let result = validate_external_statistics(
            &descriptor("gas_supplier:meter_reading", "gas_supplier"),
            &[stat_at(10, 0), stat_at(11, 0)],
        );
        assert!(result.is_ok());
    }

    #[test]
    fn rejects_invalid_series_id() {
        let err = validate_external_statistics(
            &descriptor("Not-Valid", "gas_supplier"),
            &[stat_at(10, 0)],
        )
        .unwrap_err();
        assert!(matches!(err, WriteError::Validation(_)));
        assert!(err.to_string().contains("Invalid statistic id"));
    }

    #[test]
    fn rejects_source_not_owning_the_namespace() {
        let err = validate_external_statistics(
            &descriptor("gas_supplier:meter_reading", "other_source"),
            &[stat_at(10, 0)],
        )
        .unwrap_err();
        assert!(err.to_string().contains("Invalid source"));

        let err = validate_external_statistics(
            &descriptor("gas_supplier:meter_reading", ""),
            &[stat_at(10, 0)],
        )
        .unwrap_err();
        assert!(err.to_string().contains("Invalid source"));
    }

    #[test]
    fn rejects_misaligned_timestamps() {
        let err = validate_external_statistics(
            &descriptor("gas_supplier:meter_reading", "gas_supplier"),
            &[stat_at(10, 0), stat_at(11, 30)],
        )
        .unwrap_err();
        assert!(err.to_string().contains("aligned to the hour"));
    }
}
