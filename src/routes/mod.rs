pub mod health;
pub mod samples;
pub mod statistics;

use axum::Router;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .nest(
            "/api",
            Router::new()
                .merge(statistics::router())
                .merge(samples::router()),
        )
        .with_state(state)
}

#[cfg(test)]
mod route_tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn healthz_responds_ok() {
        let app = router(crate::test_support::test_state());
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn statistics_query_requires_start() {
        let app = router(crate::test_support::test_state());
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/statistics/query?series_ids[]=recorder:temp")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn statistics_query_rejects_bad_granularity() {
        let app = router(crate::test_support::test_state());
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/statistics/query?start=2026-05-01T00:00:00Z&granularity=week")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn import_rejects_invalid_series_id_before_touching_the_store() {
        let app = router(crate::test_support::test_state());
        let body = serde_json::json!({
            "metadata": {
                "series_id": "Not-Valid",
                "source": "gas_supplier",
                "has_sum": true
            },
            "stats": [{"start": "2026-05-01T10:00:00Z", "sum": 1.0}]
        });
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/statistics/import")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn import_rejects_misaligned_timestamp_before_touching_the_store() {
        let app = router(crate::test_support::test_state());
        let body = serde_json::json!({
            "metadata": {
                "series_id": "gas_supplier:meter_reading",
                "source": "gas_supplier",
                "has_sum": true
            },
            "stats": [{"start": "2026-05-01T10:30:00Z", "sum": 1.0}]
        });
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/statistics/import")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn ingest_rejects_unknown_sample_kind() {
        let app = router(crate::test_support::test_state());
        let body = serde_json::json!({
            "items": [{"series_id": "recorder:temp", "value": 1.0, "kind": "gauge"}]
        });
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/samples/ingest")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), axum::http::StatusCode::BAD_REQUEST);
    }
}
