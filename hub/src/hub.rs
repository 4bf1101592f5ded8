//! HTTP/WebSocket router.
//!
//! Mirrors `yahoo_logic::downstream::run`'s shape: an axum `Router` with a
//! `/ws` upgrade route and a `/health` route, plus two admin endpoints the
//! external app calls to push lobby/match updates into the hub rather than
//! have the hub poll for them.

use std::sync::Arc;

use axum::extract::{ws::WebSocketUpgrade, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use subtle::ConstantTimeEq;

use crate::connection;
use crate::lobby;
use crate::state::AppState;
use crate::wire::messages::{MatchStatusKind, Payload};

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/notify/lobbies", post(notify_lobbies_handler))
        .route("/notify/match", post(notify_match_handler))
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection::handle_socket(socket, state))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    connections: usize,
    matches: usize,
    lobby_subscribers: usize,
    timestamp: i64,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let matches = state.rooms.read().await.len();
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    Json(HealthResponse {
        status: "ok",
        connections: state.registry.connection_count(),
        matches,
        lobby_subscribers: state.registry.lobby_subscriber_count(),
        timestamp,
    })
}

/// Constant-time comparison against the configured admin token, independent
/// of the token's length leaking through early-exit comparison timing.
fn is_authorized(state: &AppState, headers: &HeaderMap) -> bool {
    let Some(header) = headers.get(axum::http::header::AUTHORIZATION) else {
        return false;
    };
    let Ok(header) = header.to_str() else {
        return false;
    };
    let Some(presented) = header.strip_prefix("Bearer ") else {
        return false;
    };
    presented.as_bytes().ct_eq(state.config.ws_api_key.as_bytes()).into()
}

/// `POST /notify/lobbies`: the external app calls this after any lobby list
/// change (match created/closed, player count changed) so the hub can push
/// a fresh `LobbiesUpdate` to every subscriber without polling.
async fn notify_lobbies_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if !is_authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    lobby::refresh_and_broadcast(&state).await;
    Json(json!({"ok": true})).into_response()
}

#[derive(serde::Deserialize)]
struct NotifyMatchBody {
    #[serde(rename = "matchId")]
    match_id: String,
    status: MatchStatusKind,
    #[serde(rename = "timeRemaining")]
    time_remaining: Option<f64>,
}

/// `POST /notify/match`: the external app pushes match lifecycle changes
/// (e.g. the match timer entering its completing phase) that have no
/// corresponding client-originated mutation to piggyback on.
async fn notify_match_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<NotifyMatchBody>,
) -> impl IntoResponse {
    if !is_authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let Some(room) = state.room(&body.match_id).await else {
        return (StatusCode::NOT_FOUND, Json(json!({"error": "match not found"}))).into_response();
    };
    let outbound = vec![crate::room::Outbound {
        recipient: crate::room::Recipient::All,
        envelope: crate::wire::envelope::Envelope::new(Payload::MatchStatus {
            match_id: body.match_id.clone(),
            status: body.status,
            time_remaining: body.time_remaining,
            player_count: room.member_count(),
        }),
    }];
    state.deliver(&body.match_id, outbound).await;
    StatusCode::NO_CONTENT.into_response()
}
