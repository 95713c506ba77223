use axum::{
    extract::{ws::WebSocketUpgrade, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;

use crate::{
    arguments::is_debug_transport_enabled,
    logger::{self, LogTag},
    webserver::{connection, state::AppState},
};

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws/:topic", get(ws_upgrade))
        .route("/api/status", get(status))
        .route("/api/topics", get(topics))
        .with_state(state)
}

/// Upgrade to a socket subscribed to `topic`; unknown topics never upgrade
async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Path(topic): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Response {
    if !state.broker.has_topic(&topic) {
        if is_debug_transport_enabled() {
            logger::debug(
                LogTag::Transport,
                &format!("Upgrade refused: unknown topic '{}'", topic),
            );
        }
        return (StatusCode::NOT_FOUND, format!("Unknown topic: {}", topic)).into_response();
    }

    ws.on_upgrade(move |socket| connection::handle_connection(socket, topic, state))
}

/// Hub metrics plus every live connection
async fn status(State(state): State<Arc<AppState>>) -> Response {
    let connections = match state.broker.connections().await {
        Ok(list) => list,
        Err(e) => {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": e.to_string(), "code": e.code()})),
            )
                .into_response()
        }
    };

    Json(json!({
        "uptime_secs": state.uptime_secs(),
        "metrics": state.broker.metrics().snapshot(),
        "connections": connections,
    }))
    .into_response()
}

async fn topics(State(state): State<Arc<AppState>>) -> Json<Vec<String>> {
    Json(state.broker.registry().identifiers())
}
