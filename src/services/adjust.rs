//! Sum adjuster: apply a constant offset to a series' cumulative sums from a
//! given instant forward, across both bucket granularities.
//!
//! The offset arrives in the caller's display unit and is converted to the
//! series' normalized unit before application. Each table is touched by one
//! set-based UPDATE, so there is no per-row read-modify-write to race with.
//! There is no idempotency key: a caller whose previous attempt has an
//! unknown outcome must not blindly retry.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::db;
use crate::services::metadata::{self, MetadataFilter};
use crate::time;
use crate::units::{self, UnitSystem};

/// The display-unit adjustment expressed in the series' normalized unit.
/// Units without a configured conversion apply the delta as given.
fn normalized_adjustment(delta: f64, unit: Option<&str>, system: UnitSystem) -> f64 {
    units::to_normalized(Some(delta), unit, system).unwrap_or(delta)
}

/// Shift all sums of `series_id` at or after `start_time` by `sum_adjustment`
/// (display units). Returns false when the series is unknown.
pub async fn adjust_statistics(
    db: &PgPool,
    system: UnitSystem,
    series_id: &str,
    start_time: DateTime<Utc>,
    sum_adjustment: f64,
) -> Result<bool> {
    let metadata = metadata::get_metadata(
        db,
        &MetadataFilter {
            series_ids: Some(vec![series_id.to_string()]),
            ..Default::default()
        },
    )
    .await?;
    let Some((metadata_id, descriptor)) = metadata.get(series_id) else {
        return Ok(false);
    };

    let adjustment = normalized_adjustment(sum_adjustment, descriptor.unit.as_deref(), system);
    let metadata_id = *metadata_id;
    // The long-term table buckets by hour, so the adjustment starts at the
    // hour containing the requested instant.
    let hourly_start = time::hour_start(start_time);

    db::retry_transient("adjust_statistics", || async {
        let mut tx = db
            .begin()
            .await
            .context("failed to begin sum adjustment transaction")?;

        sqlx::query(
            r#"
            UPDATE statistics_short_term
            SET sum = sum + $1
            WHERE metadata_id = $2 AND start >= $3
            "#,
        )
        .bind(adjustment)
        .bind(metadata_id)
        .bind(start_time)
        .execute(&mut *tx)
        .await
        .context("failed to adjust short-term sums")?;

        sqlx::query(
            r#"
            UPDATE statistics
            SET sum = sum + $1
            WHERE metadata_id = $2 AND start >= $3
            "#,
        )
        .bind(adjustment)
        .bind(metadata_id)
        .bind(hourly_start)
        .execute(&mut *tx)
        .await
        .context("failed to adjust hourly sums")?;

        tx.commit()
            .await
            .context("failed to commit sum adjustment transaction")?;
        Ok(())
    })
    .await?;

    tracing::info!(
        series_id,
        adjustment,
        start = %start_time,
        "adjusted statistics sums"
    );
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjustment_converts_display_volume_to_normalized() {
        // 35.31 ft³ is one cubic meter.
        let adjusted = normalized_adjustment(35.31466672148859, Some("m³"), UnitSystem::Imperial);
        assert!((adjusted - 1.0).abs() < 1e-9);
    }

    #[test]
    fn adjustment_is_identity_for_unknown_units() {
        let adjusted = normalized_adjustment(5.0, Some("kWh"), UnitSystem::Imperial);
        assert_eq!(adjusted, 5.0);
        let adjusted = normalized_adjustment(5.0, None, UnitSystem::Metric);
        assert_eq!(adjusted, 5.0);
    }

    #[test]
    fn metric_volume_needs_no_conversion() {
        let adjusted = normalized_adjustment(2.5, Some("m³"), UnitSystem::Metric);
        assert_eq!(adjusted, 2.5);
    }
}
