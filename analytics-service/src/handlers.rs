//! Axum HTTP handlers for the analytics service.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use telemetry_model::Interval;

use crate::engine::AggregationEngine;
use crate::query::IntervalParams;

pub struct AppState {
    pub engine: AggregationEngine,
    pub default_interval: Interval,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/analytics/intervals", get(intervals))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"})))
}

// ------------------------------------------------------------------ //
//  GET /analytics/intervals                                           //
// ------------------------------------------------------------------ //

/// Chart buckets for a local time range. An inverted or empty range is not
/// an error; it simply has no buckets.
pub async fn intervals(
    State(state): State<Arc<AppState>>,
    Query(params): Query<IntervalParams>,
) -> impl IntoResponse {
    let echo = serde_json::json!(params);
    let query = match params.into_query(state.engine.offset(), state.default_interval) {
        Ok(q) => q,
        Err(e) => {
            warn!(error = %e, "rejected interval query");
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"success": false, "error": e.to_string()})),
            );
        }
    };

    match state.engine.buckets(&query.filter, query.range, query.interval).await {
        Ok(buckets) => {
            info!(
                interval = %query.interval,
                start = %query.range.start,
                end = %query.range.end,
                count = buckets.len(),
                "GET /analytics/intervals processed"
            );
            (
                StatusCode::OK,
                Json(serde_json::json!({
                    "success": true,
                    "interval": query.interval,
                    "count": buckets.len(),
                    "filters": echo,
                    "data": buckets,
                })),
            )
        }
        Err(e) => {
            error!(error = %e, "interval query failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"success": false, "error": e.to_string()})),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{MemorySampleSource, RawSample, SampleKind};
    use axum::response::Response;
    use chrono::{FixedOffset, TimeZone, Utc};
    use telemetry_model::Category;

    fn state(source: MemorySampleSource) -> Arc<AppState> {
        let offset = FixedOffset::east_opt(7 * 3600).unwrap();
        Arc::new(AppState {
            engine: AggregationEngine::new(Arc::new(source), offset),
            default_interval: Interval::FiveMinutes,
        })
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn params(start: &str, end: &str) -> IntervalParams {
        IntervalParams {
            start: Some(start.into()),
            end: Some(end.into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn returns_buckets_with_envelope() {
        let source = MemorySampleSource::new(vec![RawSample {
            kind: SampleKind::Weight,
            device_id: "DEV-LT2-ORG".into(),
            category: Category::Organic,
            // 00:02 local
            timestamp: Utc.with_ymd_and_hms(2024, 4, 30, 17, 2, 0).unwrap(),
            value: 1.5,
        }]);
        let resp = intervals(
            State(state(source)),
            Query(params("2024-05-01T00:00:00", "2024-05-01T01:00:00")),
        )
        .await
        .into_response();

        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["interval"], "5-minute");
        assert_eq!(body["count"], 1);
        assert_eq!(body["data"][0]["bucketStartLocal"], "00:00");
        assert_eq!(body["data"][0]["averageWeight"], 1.5);
    }

    #[tokio::test]
    async fn inverted_range_is_empty_not_an_error() {
        let source = MemorySampleSource::default();
        let resp = intervals(
            State(state(source.clone())),
            Query(params("2024-05-01T01:00:00", "2024-05-01T00:00:00")),
        )
        .await
        .into_response();

        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["count"], 0);
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn bad_timestamp_is_400() {
        let resp = intervals(
            State(state(MemorySampleSource::default())),
            Query(params("not-a-date", "2024-05-01T00:00:00")),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_interval_is_400() {
        let mut p = params("2024-05-01T00:00:00", "2024-05-01T01:00:00");
        p.interval = Some("fortnightly".into());
        let resp = intervals(State(state(MemorySampleSource::default())), Query(p))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
