//! Read-oriented query entry points: range queries with front-gap look-back,
//! last-N queries, latest short-term rows, and the series id listing.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use sqlx::PgPool;
use std::collections::{BTreeMap, HashMap};

use crate::model::{BucketTable, Granularity, MetadataMap, StatisticPoint};
use crate::services::metadata::{self, MetadataFilter};
use crate::services::producer::ProducerRegistry;
use crate::services::reducer;
use crate::units::{self, UnitSystem};

#[derive(Debug, Clone)]
pub struct RangeQuery {
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub series_ids: Option<Vec<String>>,
    pub granularity: Granularity,
    pub convert_units: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct StatsRow {
    metadata_id: i64,
    start: DateTime<Utc>,
    mean: Option<f64>,
    min: Option<f64>,
    max: Option<f64>,
    last_reset: Option<DateTime<Utc>>,
    state: Option<f64>,
    sum: Option<f64>,
}

impl StatsRow {
    fn into_point(self, table: BucketTable) -> StatisticPoint {
        StatisticPoint {
            start: self.start,
            end: self.start + table.duration(),
            mean: self.mean,
            min: self.min,
            max: self.max,
            last_reset: self.last_reset,
            state: self.state,
            sum: self.sum,
        }
    }
}

/// Convert every value field of a point from the normalized unit to the
/// display unit. `last_reset` is an instant, not a value, and stays as is.
fn convert_point(point: &mut StatisticPoint, unit: Option<&str>, system: UnitSystem) {
    point.mean = units::to_display(point.mean, unit, system);
    point.min = units::to_display(point.min, unit, system);
    point.max = units::to_display(point.max, unit, system);
    point.state = units::to_display(point.state, unit, system);
    point.sum = units::to_display(point.sum, unit, system);
}

/// Statistics for the requested series during `[start_time, end_time)`,
/// keyed by series id. Series whose earliest selected row starts after
/// `start_time` get the last row from before the window prepended, so the
/// response always reports the value in effect at the window start. Series
/// with no rows at all are omitted.
pub async fn statistics_during_period(
    db: &PgPool,
    system: UnitSystem,
    tz: Tz,
    query: &RangeQuery,
) -> Result<BTreeMap<String, Vec<StatisticPoint>>> {
    let filter = MetadataFilter {
        series_ids: query.series_ids.clone(),
        ..Default::default()
    };
    let metadata = metadata::get_metadata(db, &filter).await?;
    if metadata.is_empty() {
        return Ok(BTreeMap::new());
    }

    let table = query.granularity.table();
    let metadata_ids: Option<Vec<i64>> = query
        .series_ids
        .as_ref()
        .map(|_| metadata.values().map(|(id, _)| *id).collect());

    let rows: Vec<StatsRow> = sqlx::query_as(&format!(
        r#"
        SELECT metadata_id, start, mean, min, max, last_reset, state, sum
        FROM {table}
        WHERE start >= $1
          AND ($2::timestamptz IS NULL OR start < $2)
          AND ($3::bigint[] IS NULL OR metadata_id = ANY($3))
        ORDER BY metadata_id, start
        "#,
        table = table.name()
    ))
    .bind(query.start_time)
    .bind(query.end_time)
    .bind(metadata_ids.as_deref())
    .fetch_all(db)
    .await
    .context("failed to query statistics rows")?;

    let mut rows_by_meta: BTreeMap<i64, Vec<StatsRow>> = BTreeMap::new();
    for row in rows {
        rows_by_meta.entry(row.metadata_id).or_default().push(row);
    }

    // Series with a gap at the front of the window need one look-back row.
    let need_lookback: Vec<i64> = rows_by_meta
        .iter()
        .filter(|(_, rows)| rows.first().is_some_and(|row| row.start > query.start_time))
        .map(|(meta_id, _)| *meta_id)
        .collect();
    if !need_lookback.is_empty() {
        for row in statistics_at_time(db, table, &need_lookback, query.start_time).await? {
            if let Some(rows) = rows_by_meta.get_mut(&row.metadata_id) {
                rows.insert(0, row);
            }
        }
    }

    Ok(assemble_points(
        rows_by_meta,
        &metadata,
        table,
        query.granularity,
        query.convert_units,
        system,
        tz,
    ))
}

/// Last known row before `start_time` for each listed series: the row with
/// the greatest surrogate id among those starting earlier.
async fn statistics_at_time(
    db: &PgPool,
    table: BucketTable,
    metadata_ids: &[i64],
    start_time: DateTime<Utc>,
) -> Result<Vec<StatsRow>> {
    let rows: Vec<StatsRow> = sqlx::query_as(&format!(
        r#"
        SELECT s.metadata_id, s.start, s.mean, s.min, s.max, s.last_reset, s.state, s.sum
        FROM {table} s
        JOIN (
            SELECT MAX(id) AS max_id
            FROM {table}
            WHERE start < $1 AND metadata_id = ANY($2)
            GROUP BY metadata_id
        ) latest ON latest.max_id = s.id
        "#,
        table = table.name()
    ))
    .bind(start_time)
    .bind(metadata_ids)
    .fetch_all(db)
    .await
    .context("failed to query look-back statistics")?;
    Ok(rows)
}

#[allow(clippy::too_many_arguments)]
fn assemble_points(
    rows_by_meta: BTreeMap<i64, Vec<StatsRow>>,
    metadata: &MetadataMap,
    table: BucketTable,
    granularity: Granularity,
    convert_units: bool,
    system: UnitSystem,
    tz: Tz,
) -> BTreeMap<String, Vec<StatisticPoint>> {
    let descriptor_by_id: HashMap<i64, (&String, Option<&str>)> = metadata
        .iter()
        .map(|(series_id, (meta_id, descriptor))| {
            (*meta_id, (series_id, descriptor.unit.as_deref()))
        })
        .collect();

    let mut result: BTreeMap<String, Vec<StatisticPoint>> = BTreeMap::new();
    for (meta_id, rows) in rows_by_meta {
        let Some((series_id, unit)) = descriptor_by_id.get(&meta_id) else {
            continue;
        };

        let mut points: Vec<StatisticPoint> = rows
            .into_iter()
            .map(|row| {
                let mut point = row.into_point(table);
                if convert_units {
                    convert_point(&mut point, *unit, system);
                }
                point
            })
            .collect();

        points = match granularity {
            Granularity::Day => reducer::reduce_statistics_per_day(tz, &points),
            Granularity::Month => reducer::reduce_statistics_per_month(tz, &points),
            _ => points,
        };

        if !points.is_empty() {
            result.insert((*series_id).clone(), points);
        }
    }
    result
}

/// Last `number_of_stats` rows for one series, newest first.
pub async fn get_last_statistics(
    db: &PgPool,
    system: UnitSystem,
    series_id: &str,
    number_of_stats: u32,
    convert_units: bool,
    table: BucketTable,
) -> Result<Vec<StatisticPoint>> {
    let metadata = metadata::get_metadata(
        db,
        &MetadataFilter {
            series_ids: Some(vec![series_id.to_string()]),
            ..Default::default()
        },
    )
    .await?;
    let Some((metadata_id, descriptor)) = metadata.get(series_id) else {
        return Ok(Vec::new());
    };

    let rows: Vec<StatsRow> = sqlx::query_as(&format!(
        r#"
        SELECT metadata_id, start, mean, min, max, last_reset, state, sum
        FROM {table}
        WHERE metadata_id = $1
        ORDER BY start DESC
        LIMIT $2
        "#,
        table = table.name()
    ))
    .bind(metadata_id)
    .bind(i64::from(number_of_stats))
    .fetch_all(db)
    .await
    .context("failed to query last statistics")?;

    Ok(rows
        .into_iter()
        .map(|row| {
            let mut point = row.into_point(table);
            if convert_units {
                convert_point(&mut point, descriptor.unit.as_deref(), system);
            }
            point
        })
        .collect())
}

/// The newest short-term row for each requested series.
pub async fn get_latest_short_term_statistics(
    db: &PgPool,
    series_ids: &[String],
) -> Result<BTreeMap<String, StatisticPoint>> {
    let metadata = metadata::get_metadata(
        db,
        &MetadataFilter {
            series_ids: Some(series_ids.to_vec()),
            ..Default::default()
        },
    )
    .await?;
    if metadata.is_empty() {
        return Ok(BTreeMap::new());
    }
    let metadata_ids: Vec<i64> = metadata.values().map(|(id, _)| *id).collect();

    let rows: Vec<StatsRow> = sqlx::query_as(
        r#"
        SELECT s.metadata_id, s.start, s.mean, s.min, s.max, s.last_reset, s.state, s.sum
        FROM statistics_short_term s
        JOIN (
            SELECT metadata_id, MAX(start) AS start_max
            FROM statistics_short_term
            WHERE metadata_id = ANY($1)
            GROUP BY metadata_id
        ) latest ON latest.metadata_id = s.metadata_id AND latest.start_max = s.start
        "#,
    )
    .bind(&metadata_ids)
    .fetch_all(db)
    .await
    .context("failed to query latest short-term statistics")?;

    let series_by_id: HashMap<i64, &String> = metadata
        .iter()
        .map(|(series_id, (meta_id, _))| (*meta_id, series_id))
        .collect();

    let mut result = BTreeMap::new();
    for row in rows {
        if let Some(series_id) = series_by_id.get(&row.metadata_id) {
            result.insert((*series_id).clone(), row.into_point(BucketTable::ShortTerm));
        }
    }
    Ok(result)
}

#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct SeriesIdInfo {
    pub series_id: String,
    pub source: String,
    pub has_mean: bool,
    pub has_sum: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Unit the series is presented in, per the user's unit system.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

/// All known series ids with display units: stored metadata unioned with ids
/// announced by list-capable producers. Stored metadata wins on conflict.
pub async fn list_statistic_ids(
    db: &PgPool,
    producers: &ProducerRegistry,
    system: UnitSystem,
    filter: &MetadataFilter,
) -> Result<Vec<SeriesIdInfo>> {
    let metadata = metadata::get_metadata(db, filter).await?;

    let mut result: BTreeMap<String, SeriesIdInfo> = BTreeMap::new();
    for (series_id, (_, descriptor)) in metadata {
        result.insert(
            series_id.clone(),
            SeriesIdInfo {
                series_id,
                source: descriptor.source,
                has_mean: descriptor.has_mean,
                has_sum: descriptor.has_sum,
                display_name: descriptor.display_name,
                unit: units::display_unit(descriptor.unit.as_deref(), system),
            },
        );
    }

    for producer in producers.producers() {
        let Some(lister) = producer.series_lister() else {
            continue;
        };
        for descriptor in lister.list_series_ids(db).await? {
            if let Some(wanted) = &filter.series_ids {
                if !wanted.contains(&descriptor.series_id) {
                    continue;
                }
            }
            if filter.requires_mean && !descriptor.has_mean {
                continue;
            }
            if filter.requires_sum && !descriptor.has_sum {
                continue;
            }
            result
                .entry(descriptor.series_id.clone())
                .or_insert_with(|| SeriesIdInfo {
                    series_id: descriptor.series_id,
                    source: descriptor.source,
                    has_mean: descriptor.has_mean,
                    has_sum: descriptor.has_sum,
                    display_name: descriptor.display_name,
                    unit: units::display_unit(descriptor.unit.as_deref(), system),
                });
        }
    }

    Ok(result.into_values().collect())
}
