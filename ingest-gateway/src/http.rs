//! Axum HTTP surface of the gateway: health, live readings, the WebSocket
//! fan-out and battery maintenance.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::watch;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use telemetry_model::Category;

use crate::bus::ConnectionState;
use crate::gateway::IngestGateway;
use crate::subscribers::ChannelSubscriber;

pub struct HttpState {
    pub gateway: Arc<IngestGateway>,
    pub bus_state: watch::Receiver<ConnectionState>,
    pub subscriber_buffer: usize,
}

pub fn router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/live", get(live))
        .route("/ws", get(ws_upgrade))
        .route("/battery/status", get(battery_status))
        .route("/battery/reset", post(reset_all_batteries))
        .route("/battery/:device_id/reset", post(reset_battery))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ------------------------------------------------------------------ //
//  GET /health                                                        //
// ------------------------------------------------------------------ //

async fn health(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let bus = *state.bus_state.borrow();
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ok",
            "bus": format!("{bus:?}").to_lowercase(),
            "subscribers": state.gateway.subscribers().len(),
            "routes": state.gateway.routes().len(),
        })),
    )
}

// ------------------------------------------------------------------ //
//  GET /live                                                          //
// ------------------------------------------------------------------ //

#[derive(Debug, Deserialize)]
pub struct LiveQuery {
    pub location: Option<String>,
    pub category: Option<String>,
}

async fn live(
    State(state): State<Arc<HttpState>>,
    Query(q): Query<LiveQuery>,
) -> impl IntoResponse {
    let cache = state.gateway.cache();

    let category = match q.category.as_deref().map(str::parse::<Category>) {
        None => None,
        Some(Ok(c)) => Some(c),
        Some(Err(e)) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"success": false, "error": e.to_string()})),
            )
        }
    };

    let data = match (q.location.as_deref(), category) {
        (Some(location), Some(category)) => serde_json::json!(cache.get(location, category)),
        (Some(location), None) => serde_json::json!(cache.get_location(location)),
        (None, None) => serde_json::json!(cache.snapshot()),
        (None, Some(_)) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"success": false, "error": "category requires location"})),
            )
        }
    };

    (StatusCode::OK, Json(serde_json::json!({"success": true, "data": data})))
}

// ------------------------------------------------------------------ //
//  GET /ws                                                            //
// ------------------------------------------------------------------ //

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<HttpState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_readings(socket, state))
}

async fn stream_readings(socket: WebSocket, state: Arc<HttpState>) {
    let (sink, stream) = socket.split();
    forward_readings(sink, stream, state).await;
}

/// Pushes every ingested reading to the client as JSON until either side
/// closes, then unregisters the subscriber.
async fn forward_readings<Tx, Rx>(mut sink: Tx, mut stream: Rx, state: Arc<HttpState>)
where
    Tx: Sink<Message> + Unpin,
    Rx: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let (subscriber, mut rx) = ChannelSubscriber::channel(state.subscriber_buffer);
    let registry = state.gateway.subscribers().clone();
    let id = registry.add(Arc::new(subscriber));
    info!(subscriber_id = id, "websocket client connected");

    loop {
        tokio::select! {
            Some(reading) = rx.recv() => {
                let text = match serde_json::to_string(&*reading) {
                    Ok(t) => t,
                    Err(e) => {
                        warn!(error = %e, "reading not serializable");
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    registry.remove(id);
    info!(subscriber_id = id, "websocket client disconnected");
}

// ------------------------------------------------------------------ //
//  Battery                                                            //
// ------------------------------------------------------------------ //

async fn battery_status(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    match state.gateway.ledger().status().await {
        Ok(states) => (
            StatusCode::OK,
            Json(serde_json::json!({"success": true, "count": states.len(), "data": states})),
        ),
        Err(e) => {
            error!(error = %e, "battery status query failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"success": false, "error": e.to_string()})),
            )
        }
    }
}

async fn reset_all_batteries(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let devices = state.gateway.routes().device_ids();
    match state.gateway.ledger().reset_all(&devices).await {
        Ok(states) => (
            StatusCode::OK,
            Json(serde_json::json!({"success": true, "count": states.len(), "data": states})),
        ),
        Err(e) => {
            error!(error = %e, "battery reset failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"success": false, "error": e.to_string()})),
            )
        }
    }
}

async fn reset_battery(
    State(state): State<Arc<HttpState>>,
    Path(device_id): Path<String>,
) -> impl IntoResponse {
    if !state.gateway.routes().contains_device(&device_id) {
        let error = format!("unknown device '{device_id}'");
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"success": false, "error": error})),
        );
    }

    match state.gateway.ledger().reset(&device_id).await {
        Ok(s) => (StatusCode::OK, Json(serde_json::json!({"success": true, "data": s}))),
        Err(e) => {
            error!(error = %e, device_id = %device_id, "battery reset failed");
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
    use axum::response::Response;
    use chrono::Utc;
    use telemetry_model::NormalizedReading;

    use crate::config::IngestConfig;
    use crate::live_cache::LiveCache;
    use crate::store::{MemoryReadingStore, ReadingStore};
    use crate::subscribers::SubscriberRegistry;

    fn state() -> Arc<HttpState> {
        let store: Arc<dyn ReadingStore> = Arc::new(MemoryReadingStore::default());
        let gateway = Arc::new(IngestGateway::new(
            &IngestConfig::default(),
            store,
            Arc::new(LiveCache::new(10)),
            Arc::new(SubscriberRegistry::new()),
        ));
        let (_tx, bus_state) = watch::channel(ConnectionState::Subscribed);
        Arc::new(HttpState {
            gateway,
            bus_state,
            subscriber_buffer: 8,
        })
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn reset_unknown_device_is_404() {
        let resp = reset_battery(State(state()), Path("DEV-NOPE".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn reset_known_device_restores_initial_level() {
        let state = state();
        state.gateway.ledger().record_message("DEV-LT2-ORG").await.unwrap();

        let resp = reset_battery(State(state.clone()), Path("DEV-LT2-ORG".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["deviceId"], "DEV-LT2-ORG");
        assert_eq!(body["data"]["percentage"], 94.0);
    }

    #[tokio::test]
    async fn live_category_without_location_is_400() {
        let q = LiveQuery {
            location: None,
            category: Some("organic".into()),
        };
        let resp = live(State(state()), Query(q)).await.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let q = LiveQuery {
            location: Some("Lt2SGLC".into()),
            category: Some("glass".into()),
        };
        let resp = live(State(state()), Query(q)).await.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn websocket_close_unregisters_subscriber() {
        let state = state();
        let registry = state.gateway.subscribers().clone();
        let (out_tx, mut out_rx) = futures::channel::mpsc::unbounded::<Message>();
        let (in_tx, in_rx) = futures::channel::mpsc::unbounded::<Result<Message, axum::Error>>();

        let task = tokio::spawn(forward_readings(out_tx, in_rx, state.clone()));
        for _ in 0..100 {
            if registry.len() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(registry.len(), 1);

        let reading = NormalizedReading {
            location: "Lt2SGLC".into(),
            category: Category::Organic,
            sensor_distances: vec![40.0],
            average_distance_cm: 40.0,
            average_fill_percentage: 60.0,
            weight_grams: 120.0,
            timestamp: Utc::now(),
        };
        assert_eq!(registry.notify_all(&reading).delivered, 1);
        match out_rx.next().await {
            Some(Message::Text(text)) => assert!(text.contains("Lt2SGLC")),
            other => panic!("expected a text frame, got {other:?}"),
        }

        in_tx.unbounded_send(Ok(Message::Close(None))).unwrap();
        task.await.unwrap();
        assert!(registry.is_empty());
    }
}
