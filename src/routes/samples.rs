use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use chrono::{DateTime, Utc};

use crate::error::map_db_error;
use crate::model::valid_series_id;
use crate::services::producer::{SAMPLE_KIND_COUNTER, SAMPLE_KIND_MEASUREMENT};
use crate::state::AppState;

const MAX_INGEST_ITEMS: usize = 50_000;

#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
pub(crate) struct SampleIngestItem {
    series_id: String,
    /// Sample instant (RFC3339); defaults to now.
    #[serde(default)]
    timestamp: Option<String>,
    value: f64,
    /// 'measurement' (mean/min/max statistics) or 'counter' (cumulative sum).
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    unit: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
}

#[derive(Debug, Clone, serde::Deserialize, utoipa::ToSchema)]
pub(crate) struct SampleIngestRequest {
    items: Vec<SampleIngestItem>,
}

#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub(crate) struct SampleIngestResponse {
    ingested: i64,
}

#[utoipa::path(
    post,
    path = "/api/samples/ingest",
    tag = "samples",
    request_body = SampleIngestRequest,
    responses(
        (status = 200, description = "Ingest result", body = SampleIngestResponse),
        (status = 400, description = "Invalid request"),
        (status = 413, description = "Payload too large")
    )
)]
pub(crate) async fn ingest_samples(
    State(state): State<AppState>,
    Json(payload): Json<SampleIngestRequest>,
) -> Result<Json<SampleIngestResponse>, (StatusCode, String)> {
    if payload.items.len() > MAX_INGEST_ITEMS {
        return Err((
            StatusCode::PAYLOAD_TOO_LARGE,
            format!(
                "Too many sample items (max {MAX_INGEST_ITEMS}, received {})",
                payload.items.len()
            ),
        ));
    }
    if payload.items.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "No samples provided".to_string()));
    }

    let mut invalid: Vec<String> = Vec::new();
    for item in &payload.items {
        if !valid_series_id(item.series_id.trim()) {
            invalid.push(item.series_id.clone());
        }
        if let Some(kind) = item.kind.as_deref() {
            if kind != SAMPLE_KIND_MEASUREMENT && kind != SAMPLE_KIND_COUNTER {
                return Err((
                    StatusCode::BAD_REQUEST,
                    format!("Invalid sample kind {kind:?}"),
                ));
            }
        }
    }
    if !invalid.is_empty() {
        invalid.sort();
        invalid.dedup();
        return Err((
            StatusCode::BAD_REQUEST,
            format!("Invalid series ids: {}", invalid.join(", ")),
        ));
    }

    let now = Utc::now();
    let mut ingested: i64 = 0;
    for item in payload.items {
        let series_id = item.series_id.trim();
        let ts = item
            .timestamp
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw.trim()).ok())
            .map(|parsed| parsed.with_timezone(&Utc))
            .unwrap_or(now);
        let kind = item
            .kind
            .as_deref()
            .unwrap_or(SAMPLE_KIND_MEASUREMENT);

        let result = sqlx::query(
            r#"
            INSERT INTO samples (series_id, ts, value, kind, unit, display_name)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (series_id, ts)
            DO UPDATE SET value = EXCLUDED.value, kind = EXCLUDED.kind, unit = EXCLUDED.unit
            "#,
        )
        .bind(series_id)
        .bind(ts)
        .bind(item.value)
        .bind(kind)
        .bind(&item.unit)
        .bind(&item.display_name)
        .execute(&state.db)
        .await
        .map_err(map_db_error)?;
        ingested += result.rows_affected() as i64;
    }

    Ok(Json(SampleIngestResponse { ingested }))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/samples/ingest", post(ingest_samples))
}
