//! Metadata registry: owns the mapping from series ids to stable surrogate
//! ids and descriptors. Every other service treats the surrogate id as an
//! opaque foreign key obtained here.

use anyhow::{Context, Result};
use sqlx::postgres::PgConnection;
use sqlx::PgPool;

use crate::model::{valid_series_id, MetadataMap, SeriesDescriptor};

#[derive(Debug, Clone, Default)]
pub struct MetadataFilter {
    pub series_ids: Option<Vec<String>>,
    pub requires_mean: bool,
    pub requires_sum: bool,
    pub source: Option<String>,
}

#[derive(sqlx::FromRow)]
struct MetaRow {
    id: i64,
    series_id: String,
    source: String,
    unit: Option<String>,
    has_mean: bool,
    has_sum: bool,
    display_name: Option<String>,
}

impl MetaRow {
    fn into_entry(self) -> (String, (i64, SeriesDescriptor)) {
        let descriptor = SeriesDescriptor {
            series_id: self.series_id.clone(),
            source: self.source,
            unit: self.unit,
            has_mean: self.has_mean,
            has_sum: self.has_sum,
            display_name: self.display_name,
        };
        (self.series_id, (self.id, descriptor))
    }
}

/// True when a producer's descriptor differs from the stored one in a field
/// that may be updated in place. `source` is immutable and deliberately not
/// compared; a producer attempting to change it is ignored.
fn descriptor_requires_update(old: &SeriesDescriptor, new: &SeriesDescriptor) -> bool {
    old.has_mean != new.has_mean || old.has_sum != new.has_sum || old.unit != new.unit
}

/// Resolve a descriptor to its surrogate id, inserting or updating metadata
/// as needed. `known` is metadata already loaded by the caller (typically the
/// producer's own snapshot); a miss there falls through to an upsert, so
/// racing creators of the same unseen series still converge on one id.
pub async fn resolve_metadata(
    conn: &mut PgConnection,
    descriptor: &SeriesDescriptor,
    known: &MetadataMap,
) -> Result<i64> {
    if let Some((metadata_id, old)) = known.get(&descriptor.series_id) {
        if descriptor_requires_update(old, descriptor) {
            sqlx::query(
                r#"
                UPDATE statistics_meta
                SET has_mean = $2, has_sum = $3, unit = $4
                WHERE series_id = $1
                "#,
            )
            .bind(&descriptor.series_id)
            .bind(descriptor.has_mean)
            .bind(descriptor.has_sum)
            .bind(&descriptor.unit)
            .execute(&mut *conn)
            .await
            .with_context(|| {
                format!("failed to update series metadata for {}", descriptor.series_id)
            })?;
            tracing::debug!(
                series_id = %descriptor.series_id,
                "updated series metadata capabilities"
            );
        }
        return Ok(*metadata_id);
    }

    // Unseen here, but possibly inserted by a concurrent writer in the
    // meantime. The conflict arm keeps a single id per series either way and
    // never touches the immutable source column.
    let row: (i64,) = sqlx::query_as(
        r#"
        INSERT INTO statistics_meta (series_id, source, unit, has_mean, has_sum, display_name)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (series_id)
        DO UPDATE SET
            has_mean = EXCLUDED.has_mean,
            has_sum = EXCLUDED.has_sum,
            unit = EXCLUDED.unit
        RETURNING id
        "#,
    )
    .bind(&descriptor.series_id)
    .bind(&descriptor.source)
    .bind(&descriptor.unit)
    .bind(descriptor.has_mean)
    .bind(descriptor.has_sum)
    .bind(&descriptor.display_name)
    .fetch_one(&mut *conn)
    .await
    .with_context(|| format!("failed to upsert series metadata for {}", descriptor.series_id))?;

    tracing::debug!(
        series_id = %descriptor.series_id,
        metadata_id = row.0,
        "added new series metadata"
    );
    Ok(row.0)
}

/// Fetch metadata matching the filter, keyed by series id. No side effects.
pub async fn get_metadata(db: &PgPool, filter: &MetadataFilter) -> Result<MetadataMap> {
    let rows: Vec<MetaRow> = sqlx::query_as(
        r#"
        SELECT id, series_id, source, unit, has_mean, has_sum, display_name
        FROM statistics_meta
        WHERE ($1::text[] IS NULL OR series_id = ANY($1))
          AND (NOT $2 OR has_mean)
          AND (NOT $3 OR has_sum)
          AND ($4::text IS NULL OR source = $4)
        "#,
    )
    .bind(filter.series_ids.as_deref())
    .bind(filter.requires_mean)
    .bind(filter.requires_sum)
    .bind(filter.source.as_deref())
    .fetch_all(db)
    .await
    .context("failed to fetch series metadata")?;

    Ok(rows.into_iter().map(MetaRow::into_entry).collect())
}

/// Same lookup usable inside an open transaction.
pub async fn get_metadata_with_conn(
    conn: &mut PgConnection,
    filter: &MetadataFilter,
) -> Result<MetadataMap> {
    let rows: Vec<MetaRow> = sqlx::query_as(
        r#"
        SELECT id, series_id, source, unit, has_mean, has_sum, display_name
        FROM statistics_meta
        WHERE ($1::text[] IS NULL OR series_id = ANY($1))
          AND (NOT $2 OR has_mean)
          AND (NOT $3 OR has_sum)
          AND ($4::text IS NULL OR source = $4)
        "#,
    )
    .bind(filter.series_ids.as_deref())
    .bind(filter.requires_mean)
    .bind(filter.requires_sum)
    .bind(filter.source.as_deref())
    .fetch_all(conn)
    .await
    .context("failed to fetch series metadata")?;

    Ok(rows.into_iter().map(MetaRow::into_entry).collect())
}

/// Delete metadata for the listed series. Bucket rows in both granularities
/// go with it via the foreign-key cascade.
pub async fn clear_statistics(db: &PgPool, series_ids: &[String]) -> Result<u64> {
    let result = sqlx::query("DELETE FROM statistics_meta WHERE series_id = ANY($1)")
        .bind(series_ids)
        .execute(db)
        .await
        .context("failed to clear series metadata")?;
    if result.rows_affected() > 0 {
        tracing::info!(
            cleared = result.rows_affected(),
            "cleared statistics series"
        );
    }
    Ok(result.rows_affected())
}

/// Override the stored unit for one series.
pub async fn update_metadata_unit(
    db: &PgPool,
    series_id: &str,
    unit: Option<&str>,
) -> Result<bool> {
    let result = sqlx::query("UPDATE statistics_meta SET unit = $2 WHERE series_id = $1")
        .bind(series_id)
        .bind(unit)
        .execute(db)
        .await
        .with_context(|| format!("failed to update unit for {series_id}"))?;
    Ok(result.rows_affected() > 0)
}

/// Re-point a series id after its upstream entity was renamed. Only rows
/// owned by `source` move; renames across sources are not a thing.
pub async fn rename_series(
    db: &PgPool,
    old_series_id: &str,
    new_series_id: &str,
    source: &str,
) -> Result<bool> {
    if !valid_series_id(new_series_id) {
        anyhow::bail!("invalid series id {new_series_id:?}");
    }
    let result = sqlx::query(
        r#"
        UPDATE statistics_meta
        SET series_id = $2
        WHERE series_id = $1 AND source = $3
        "#,
    )
    .bind(old_series_id)
    .bind(new_series_id)
    .bind(source)
    .execute(db)
    .await
    .with_context(|| format!("failed to rename series {old_series_id} -> {new_series_id}"))?;
    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(unit: Option<&str>, has_mean: bool, has_sum: bool) -> SeriesDescriptor {
        SeriesDescriptor {
            series_id: "sampler:outdoor_temp".to_string(),
            source: "sampler".to_string(),
            unit: unit.map(str::to_string),
            has_mean,
            has_sum,
            display_name: None,
        }
    }

    #[test]
    fn capability_changes_require_update() {
        let old = descriptor(Some("°C"), true, false);
        assert!(descriptor_requires_update(&old, &descriptor(Some("°C"), true, true)));
        assert!(descriptor_requires_update(&old, &descriptor(Some("°F"), true, false)));
        assert!(descriptor_requires_update(&old, &descriptor(None, true, false)));
        assert!(!descriptor_requires_update(&old, &descriptor(Some("°C"), true, false)));
    }

    #[test]
    fn source_changes_are_ignored() {
        let old = descriptor(Some("°C"), true, false);
        let mut new = descriptor(Some("°C"), true, false);
        new.source = "other_source".to_string();
        new.display_name = Some("Renamed".to_string());
        assert!(!descriptor_requires_update(&old, &new));
    }
}
