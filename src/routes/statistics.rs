use axum::extract::{RawQuery, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use url::form_urlencoded;

use crate::error::{internal_error, is_unique_violation};
use crate::model::{Granularity, SeriesDescriptor, StatValues, StatisticPoint};
use crate::services::metadata::{self, MetadataFilter};
use crate::services::producer::ValidationIssue;
use crate::services::{adjust, compiler, dedup, importer, query};
use crate::state::AppState;
use crate::time;

const MAX_QUERY_SERIES: usize = 500;
const MAX_IMPORT_SAMPLES: usize = 10_000;
const MAX_LAST_STATS: u32 = 1000;

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub(crate) struct StatisticPointDto {
    start: String,
    end: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    mean: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_reset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    state: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sum: Option<f64>,
}

impl From<StatisticPoint> for StatisticPointDto {
    fn from(point: StatisticPoint) -> Self {
        Self {
            start: point.start.to_rfc3339(),
            end: point.end.to_rfc3339(),
            mean: point.mean,
            min: point.min,
            max: point.max,
            last_reset: point.last_reset.map(|ts| ts.to_rfc3339()),
            state: point.state,
            sum: point.sum,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub(crate) struct StatisticSeries {
    series_id: String,
    points: Vec<StatisticPointDto>,
}

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub(crate) struct StatisticsResponse {
    series: Vec<StatisticSeries>,
}

#[utoipa::path(
    get,
    path = "/api/statistics/query",
    tag = "statistics",
    params(
        ("series_ids" = Option<Vec<String>>, Query, description = "Series ids; all series when omitted"),
        ("start" = String, Query, description = "Start timestamp (RFC3339)"),
        ("end" = Option<String>, Query, description = "End timestamp (RFC3339, exclusive); open-ended when omitted"),
        ("granularity" = Option<String>, Query, description = "5minute, hour, day or month (default hour)"),
        ("units" = Option<String>, Query, description = "'display' converts values to the configured unit system")
    ),
    responses(
        (status = 200, description = "Statistics rows per series", body = StatisticsResponse),
        (status = 400, description = "Invalid request")
    )
)]
pub(crate) async fn query_statistics(
    State(state): State<AppState>,
    RawQuery(raw): RawQuery,
) -> Result<Json<StatisticsResponse>, (StatusCode, String)> {
    let mut series_ids: Vec<String> = Vec::new();
    let mut start_raw: Option<String> = None;
    let mut end_raw: Option<String> = None;
    let mut granularity_raw: Option<String> = None;
    let mut units_raw: Option<String> = None;

    if let Some(raw) = raw {
        for (key, value) in form_urlencoded::parse(raw.as_bytes()) {
            match key.as_ref() {
                "series_ids[]" | "series_ids" => {
                    let value = value.trim();
                    if !value.is_empty() {
                        series_ids.push(value.to_string());
                    }
                }
                "start" => start_raw = Some(value.into_owned()),
                "end" => end_raw = Some(value.into_owned()),
                "granularity" => granularity_raw = Some(value.into_owned()),
                "units" => units_raw = Some(value.into_owned()),
                _ => {}
            }
        }
    }

    if series_ids.len() > MAX_QUERY_SERIES {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("Too many series_ids (max {MAX_QUERY_SERIES})"),
        ));
    }

    let start_raw = start_raw.ok_or((StatusCode::BAD_REQUEST, "Missing start".to_string()))?;
    let start_time = parse_ts(&start_raw)?;
    let end_time = end_raw.as_deref().map(parse_ts).transpose()?;
    if let Some(end_time) = end_time {
        if end_time <= start_time {
            return Err((
                StatusCode::BAD_REQUEST,
                "end must be after start".to_string(),
            ));
        }
    }

    let granularity = match granularity_raw.as_deref() {
        None => Granularity::Hour,
        Some(value) => Granularity::parse(value).ok_or((
            StatusCode::BAD_REQUEST,
            format!("Invalid granularity {value:?}"),
        ))?,
    };
    let convert_units = units_raw
        .as_deref()
        .map(|value| value.eq_ignore_ascii_case("display"))
        .unwrap_or(false);

    let range = query::RangeQuery {
        start_time,
        end_time,
        series_ids: (!series_ids.is_empty()).then_some(series_ids),
        granularity,
        convert_units,
    };

    let result = query::statistics_during_period(
        &state.db,
        state.config.unit_system,
        state.config.timezone,
        &range,
    )
    .await
    .map_err(internal_error)?;

    let series = result
        .into_iter()
        .map(|(series_id, points)| StatisticSeries {
            series_id,
            points: points.into_iter().map(StatisticPointDto::from).collect(),
        })
        .collect();
    Ok(Json(StatisticsResponse { series }))
}

#[utoipa::path(
    get,
    path = "/api/statistics/last",
    tag = "statistics",
    params(
        ("series_id" = String, Query, description = "Series id"),
        ("count" = Option<u32>, Query, description = "Number of rows (default 1)"),
        ("granularity" = Option<String>, Query, description = "5minute or hour (default hour)"),
        ("units" = Option<String>, Query, description = "'display' converts values to the configured unit system")
    ),
    responses(
        (status = 200, description = "Newest rows for the series, newest first", body = StatisticsResponse),
        (status = 400, description = "Invalid request")
    )
)]
pub(crate) async fn last_statistics(
    State(state): State<AppState>,
    RawQuery(raw): RawQuery,
) -> Result<Json<StatisticsResponse>, (StatusCode, String)> {
    let mut series_id: Option<String> = None;
    let mut count: u32 = 1;
    let mut granularity_raw: Option<String> = None;
    let mut units_raw: Option<String> = None;

    if let Some(raw) = raw {
        for (key, value) in form_urlencoded::parse(raw.as_bytes()) {
            match key.as_ref() {
                "series_id" => series_id = Some(value.trim().to_string()),
                "count" => count = value.parse::<u32>().unwrap_or(1),
                "granularity" => granularity_raw = Some(value.into_owned()),
                "units" => units_raw = Some(value.into_owned()),
                _ => {}
            }
        }
    }

    let series_id = series_id
        .filter(|value| !value.is_empty())
        .ok_or((StatusCode::BAD_REQUEST, "Missing series_id".to_string()))?;
    let count = count.clamp(1, MAX_LAST_STATS);
    let table = match granularity_raw.as_deref() {
        None | Some("hour") => Granularity::Hour.table(),
        Some("5minute") => Granularity::FiveMinute.table(),
        Some(other) => {
            return Err((
                StatusCode::BAD_REQUEST,
                format!("Invalid granularity {other:?} (expected 5minute or hour)"),
            ))
        }
    };
    let convert_units = units_raw
        .as_deref()
        .map(|value| value.eq_ignore_ascii_case("display"))
        .unwrap_or(false);

    let points = query::get_last_statistics(
        &state.db,
        state.config.unit_system,
        &series_id,
        count,
        convert_units,
        table,
    )
    .await
    .map_err(internal_error)?;

    let series = if points.is_empty() {
        Vec::new()
    } else {
        vec![StatisticSeries {
            series_id,
            points: points.into_iter().map(StatisticPointDto::from).collect(),
        }]
    };
    Ok(Json(StatisticsResponse { series }))
}

#[utoipa::path(
    get,
    path = "/api/statistics/latest-short-term",
    tag = "statistics",
    params(
        ("series_ids" = Vec<String>, Query, description = "Series ids")
    ),
    responses(
        (status = 200, description = "Newest short-term row per series", body = StatisticsResponse)
    )
)]
pub(crate) async fn latest_short_term_statistics(
    State(state): State<AppState>,
    RawQuery(raw): RawQuery,
) -> Result<Json<StatisticsResponse>, (StatusCode, String)> {
    let mut series_ids: Vec<String> = Vec::new();
    if let Some(raw) = raw {
        for (key, value) in form_urlencoded::parse(raw.as_bytes()) {
            if matches!(key.as_ref(), "series_ids[]" | "series_ids") {
                let value = value.trim();
                if !value.is_empty() {
                    series_ids.push(value.to_string());
                }
            }
        }
    }
    if series_ids.is_empty() {
        return Ok(Json(StatisticsResponse { series: Vec::new() }));
    }

    let latest = query::get_latest_short_term_statistics(&state.db, &series_ids)
        .await
        .map_err(internal_error)?;

    let series = latest
        .into_iter()
        .map(|(series_id, point)| StatisticSeries {
            series_id,
            points: vec![StatisticPointDto::from(point)],
        })
        .collect();
    Ok(Json(StatisticsResponse { series }))
}

#[utoipa::path(
    get,
    path = "/api/statistics/ids",
    tag = "statistics",
    params(
        ("series_ids" = Option<Vec<String>>, Query, description = "Restrict to these series ids"),
        ("statistic_type" = Option<String>, Query, description = "'mean' or 'sum' keeps only series with that capability"),
        ("source" = Option<String>, Query, description = "Restrict to one source")
    ),
    responses(
        (status = 200, description = "Known series ids with display units", body = Vec<query::SeriesIdInfo>),
        (status = 400, description = "Invalid request")
    )
)]
pub(crate) async fn list_statistic_ids(
    State(state): State<AppState>,
    RawQuery(raw): RawQuery,
) -> Result<Json<Vec<query::SeriesIdInfo>>, (StatusCode, String)> {
    let mut filter = MetadataFilter::default();
    let mut series_ids: Vec<String> = Vec::new();

    if let Some(raw) = raw {
        for (key, value) in form_urlencoded::parse(raw.as_bytes()) {
            match key.as_ref() {
                "series_ids[]" | "series_ids" => {
                    let value = value.trim();
                    if !value.is_empty() {
                        series_ids.push(value.to_string());
                    }
                }
                "statistic_type" => match value.as_ref() {
                    "mean" => filter.requires_mean = true,
                    "sum" => filter.requires_sum = true,
                    other => {
                        return Err((
                            StatusCode::BAD_REQUEST,
                            format!("Invalid statistic_type {other:?}"),
                        ))
                    }
                },
                "source" => {
                    let value = value.trim();
                    if !value.is_empty() {
                        filter.source = Some(value.to_string());
                    }
                }
                _ => {}
            }
        }
    }
    filter.series_ids = (!series_ids.is_empty()).then_some(series_ids);

    let ids = query::list_statistic_ids(
        &state.db,
        &state.producers,
        state.config.unit_system,
        &filter,
    )
    .await
    .map_err(internal_error)?;
    Ok(Json(ids))
}

#[utoipa::path(
    get,
    path = "/api/statistics/validate",
    tag = "statistics",
    responses(
        (status = 200, description = "Validation issues reported by producers", body = Vec<ValidationIssue>)
    )
)]
pub(crate) async fn validate_statistics(
    State(state): State<AppState>,
) -> Result<Json<Vec<ValidationIssue>>, (StatusCode, String)> {
    let mut issues = Vec::new();
    for producer in state.producers.producers() {
        let Some(validator) = producer.validator() else {
            continue;
        };
        let mut found = validator
            .validate(&state.db)
            .await
            .map_err(internal_error)?;
        issues.append(&mut found);
    }
    Ok(Json(issues))
}

#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
pub(crate) struct CompileRequest {
    /// Period to compile (RFC3339, floored to its 5-minute boundary).
    /// Defaults to the most recently completed period.
    #[serde(default)]
    start: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub(crate) struct CompileResponse {
    compiled: bool,
    start: String,
}

#[utoipa::path(
    post,
    path = "/api/statistics/compile",
    tag = "statistics",
    request_body = CompileRequest,
    responses(
        (status = 200, description = "Compilation result", body = CompileResponse),
        (status = 400, description = "Invalid request")
    )
)]
pub(crate) async fn compile_statistics(
    State(state): State<AppState>,
    Json(payload): Json<CompileRequest>,
) -> Result<Json<CompileResponse>, (StatusCode, String)> {
    let start = match payload.start.as_deref() {
        Some(raw) => time::period_start(parse_ts(raw)?),
        None => time::previous_period(Utc::now()),
    };

    let compiled = compiler::compile_statistics(&state, start)
        .await
        .map_err(internal_error)?;
    Ok(Json(CompileResponse {
        compiled,
        start: start.to_rfc3339(),
    }))
}

#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
pub(crate) struct ImportMetadataDto {
    series_id: String,
    source: String,
    #[serde(default)]
    unit: Option<String>,
    #[serde(default)]
    has_mean: bool,
    #[serde(default)]
    has_sum: bool,
    #[serde(default)]
    display_name: Option<String>,
}

#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
pub(crate) struct ImportSampleDto {
    start: String,
    #[serde(default)]
    mean: Option<f64>,
    #[serde(default)]
    min: Option<f64>,
    #[serde(default)]
    max: Option<f64>,
    #[serde(default)]
    last_reset: Option<String>,
    #[serde(default)]
    state: Option<f64>,
    #[serde(default)]
    sum: Option<f64>,
}

#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
pub(crate) struct ImportRequest {
    metadata: ImportMetadataDto,
    stats: Vec<ImportSampleDto>,
}

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub(crate) struct ImportResponse {
    imported: usize,
}

#[utoipa::path(
    post,
    path = "/api/statistics/import",
    tag = "statistics",
    request_body = ImportRequest,
    responses(
        (status = 200, description = "Import result", body = ImportResponse),
        (status = 400, description = "Validation failed"),
        (status = 413, description = "Payload too large")
    )
)]
pub(crate) async fn import_statistics(
    State(state): State<AppState>,
    Json(payload): Json<ImportRequest>,
) -> Result<Json<ImportResponse>, (StatusCode, String)> {
    if payload.stats.len() > MAX_IMPORT_SAMPLES {
        return Err((
            StatusCode::PAYLOAD_TOO_LARGE,
            format!(
                "Too many statistics (max {MAX_IMPORT_SAMPLES}, received {})",
                payload.stats.len()
            ),
        ));
    }

    let descriptor = SeriesDescriptor {
        series_id: payload.metadata.series_id,
        source: payload.metadata.source,
        unit: payload.metadata.unit,
        has_mean: payload.metadata.has_mean,
        has_sum: payload.metadata.has_sum,
        display_name: payload.metadata.display_name,
    };

    let mut stats = Vec::with_capacity(payload.stats.len());
    for sample in payload.stats {
        let start = parse_ts(&sample.start)?;
        let last_reset = sample.last_reset.as_deref().map(parse_ts).transpose()?;
        stats.push(StatValues {
            start,
            mean: sample.mean,
            min: sample.min,
            max: sample.max,
            last_reset,
            state: sample.state,
            sum: sample.sum,
        });
    }

    let imported = stats.len();
    importer::add_external_statistics(&state.db, &descriptor, &stats)
        .await
        .map_err(|err| err.into_response())?;
    Ok(Json(ImportResponse { imported }))
}

#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
pub(crate) struct AdjustSumRequest {
    series_id: String,
    /// Instant from which sums shift forward (RFC3339).
    start_time: String,
    /// Offset in the caller's display unit.
    adjustment: f64,
}

#[utoipa::path(
    post,
    path = "/api/statistics/adjust-sum",
    tag = "statistics",
    request_body = AdjustSumRequest,
    responses(
        (status = 204, description = "Adjustment applied"),
        (status = 404, description = "Unknown series"),
        (status = 400, description = "Invalid request")
    )
)]
pub(crate) async fn adjust_sum(
    State(state): State<AppState>,
    Json(payload): Json<AdjustSumRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    let start_time = parse_ts(&payload.start_time)?;
    let found = adjust::adjust_statistics(
        &state.db,
        state.config.unit_system,
        &payload.series_id,
        start_time,
        payload.adjustment,
    )
    .await
    .map_err(internal_error)?;

    if !found {
        return Err((
            StatusCode::NOT_FOUND,
            format!("Unknown series {:?}", payload.series_id),
        ));
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
pub(crate) struct ClearStatisticsRequest {
    series_ids: Vec<String>,
}

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub(crate) struct ClearStatisticsResponse {
    cleared: u64,
}

#[utoipa::path(
    delete,
    path = "/api/statistics",
    tag = "statistics",
    request_body = ClearStatisticsRequest,
    responses(
        (status = 200, description = "Series cleared", body = ClearStatisticsResponse),
        (status = 400, description = "Invalid request")
    )
)]
pub(crate) async fn clear_statistics(
    State(state): State<AppState>,
    Json(payload): Json<ClearStatisticsRequest>,
) -> Result<Json<ClearStatisticsResponse>, (StatusCode, String)> {
    if payload.series_ids.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "No series_ids provided".to_string()));
    }
    let cleared = metadata::clear_statistics(&state.db, &payload.series_ids)
        .await
        .map_err(internal_error)?;
    Ok(Json(ClearStatisticsResponse { cleared }))
}

#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
pub(crate) struct UpdateUnitRequest {
    series_id: String,
    #[serde(default)]
    unit: Option<String>,
}

#[utoipa::path(
    post,
    path = "/api/statistics/metadata/unit",
    tag = "statistics",
    request_body = UpdateUnitRequest,
    responses(
        (status = 204, description = "Unit updated"),
        (status = 404, description = "Unknown series")
    )
)]
pub(crate) async fn update_metadata_unit(
    State(state): State<AppState>,
    Json(payload): Json<UpdateUnitRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    let found =
        metadata::update_metadata_unit(&state.db, &payload.series_id, payload.unit.as_deref())
            .await
            .map_err(internal_error)?;
    if !found {
        return Err((
            StatusCode::NOT_FOUND,
            format!("Unknown series {:?}", payload.series_id),
        ));
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
pub(crate) struct RenameSeriesRequest {
    old_series_id: String,
    new_series_id: String,
    source: String,
}

#[utoipa::path(
    post,
    path = "/api/statistics/rename",
    tag = "statistics",
    request_body = RenameSeriesRequest,
    responses(
        (status = 204, description = "Series renamed"),
        (status = 404, description = "Unknown series"),
        (status = 409, description = "New series id already exists")
    )
)]
pub(crate) async fn rename_series(
    State(state): State<AppState>,
    Json(payload): Json<RenameSeriesRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    let renamed = metadata::rename_series(
        &state.db,
        &payload.old_series_id,
        &payload.new_series_id,
        &payload.source,
    )
    .await
    .map_err(|err| {
        let is_conflict = err.chain().any(|cause| {
            cause
                .downcast_ref::<sqlx::Error>()
                .is_some_and(is_unique_violation)
        });
        if is_conflict {
            (
                StatusCode::CONFLICT,
                format!("Series id {:?} already exists", payload.new_series_id),
            )
        } else {
            (StatusCode::BAD_REQUEST, format!("{err:#}"))
        }
    })?;
    if !renamed {
        return Err((
            StatusCode::NOT_FOUND,
            format!("Unknown series {:?}", payload.old_series_id),
        ));
    }
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/api/statistics/repair-duplicates",
    tag = "statistics",
    responses(
        (status = 200, description = "Repair summary", body = dedup::DedupReport)
    )
)]
pub(crate) async fn repair_duplicates(
    State(state): State<AppState>,
) -> Result<Json<dedup::DedupReport>, (StatusCode, String)> {
    let report = dedup::delete_duplicates(&state.db, &state.config.data_root)
        .await
        .map_err(internal_error)?;
    Ok(Json(report))
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>, (StatusCode, String)> {
    let parsed = DateTime::parse_from_rfc3339(raw.trim()).map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            format!("Invalid or naive timestamp {raw:?}"),
        )
    })?;
    Ok(parsed.with_timezone(&Utc))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/statistics/query", get(query_statistics))
        .route("/statistics/last", get(last_statistics))
        .route(
            "/statistics/latest-short-term",
            get(latest_short_term_statistics),
        )
        .route("/statistics/ids", get(list_statistic_ids))
        .route("/statistics/validate", get(validate_statistics))
        .route("/statistics/compile", post(compile_statistics))
        .route("/statistics/import", post(import_statistics))
        .route("/statistics/adjust-sum", post(adjust_sum))
        .route("/statistics/metadata/unit", post(update_metadata_unit))
        .route("/statistics/rename", post(rename_series))
        .route("/statistics/repair-duplicates", post(repair_duplicates))
        .route("/statistics", delete(clear_statistics))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_rfc3339_timestamps_to_utc() {
        let parsed = parse_ts("2026-05-01T10:00:00-04:00").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2026, 5, 1, 14, 0, 0).unwrap());
    }

    #[test]
    fn rejects_naive_timestamps() {
        let err = parse_ts("2026-05-01T10:00:00").unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
        assert!(err.1.contains("naive"));
    }

    #[test]
    fn point_dto_serializes_timestamps_as_rfc3339() {
        let start = Utc.with_ymd_and_hms(2026, 5, 1, 10, 0, 0).unwrap();
        let dto = StatisticPointDto::from(StatisticPoint {
            start,
            end: start + chrono::Duration::hours(1),
            mean: Some(1.5),
            min: None,
            max: None,
            last_reset: Some(start),
            state: None,
            sum: Some(2.0),
        });
        assert_eq!(dto.start, "2026-05-01T10:00:00+00:00");
        assert_eq!(dto.end, "2026-05-01T11:00:00+00:00");
        assert_eq!(dto.last_reset.as_deref(), Some("2026-05-01T10:00:00+00:00"));

        let json = serde_json::to_value(&dto).unwrap();
        assert!(json.get("min").is_none());
        assert_eq!(json["sum"], 2.0);
    }
}
