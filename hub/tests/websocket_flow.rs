//! End-to-end coverage over a real TCP listener and `tokio-tungstenite`
//! client, exercising the parts unit tests inside each module can't:
//! the axum upgrade handshake, the bincode-over-binary-frame wire format,
//! and the connection task's actual 50 ms batch timer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use hub::config::Config;
use hub::state::AppState;
use hub::wire::envelope::Envelope;
use hub::wire::messages::{Clip, ClipDelta, ClipKind, ClipProperties, Payload, TrackKind, TrackSnapshot};

fn test_config() -> Config {
    Config {
        ws_port: 0,
        api_base_url: "http://127.0.0.1:0".to_string(),
        ws_api_key: "test-admin-token".to_string(),
        external_app_token: None,
        log_dir: "logs".to_string(),
        log_filter: "warn".to_string(),
        batch_window_ms: 50,
        persist_debounce_ms: 3000,
        vote_kick_expiry_secs: 30,
        chat_rate_window_secs: 10,
        chat_rate_max: 5,
        idle_timeout_secs: 120,
        zone_buffer_secs: 2.0,
        chat_history_cap: 100,
        shutdown_grace_secs: 10,
    }
}

/// Boots the router on an ephemeral port and seeds one match room with a
/// single video track, bypassing the external-app fetch entirely.
async fn spawn_server() -> (SocketAddr, Arc<AppState>) {
    let state = AppState::new(test_config());
    let room = Arc::new(hub::room::MatchRoom::new(
        "match-1".to_string(),
        60.0,
        vec![TrackSnapshot {
            track_id: "track-1".to_string(),
            kind: TrackKind::Video,
            clips: vec![],
        }],
    ));
    state.rooms.write().await.insert("match-1".to_string(), room);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = hub::hub::router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

async fn connect(addr: SocketAddr) -> tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>> {
    let url = format!("ws://{addr}/ws");
    let (stream, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    stream
}

fn send(envelope: Envelope) -> WsMessage {
    WsMessage::Binary(envelope.encode().unwrap().into())
}

async fn recv_payload(
    stream: &mut tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
) -> Payload {
    loop {
        match stream.next().await.unwrap().unwrap() {
            WsMessage::Binary(bytes) => return Envelope::decode(&bytes).unwrap().payload,
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Reads frames until one matches `want`, discarding everything else —
/// insulates these tests from the exact ordering of the bookkeeping
/// messages (`PlayerCount`, `PlayerJoined`, chat replay) a join also emits.
async fn recv_until(
    stream: &mut tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    want: fn(&Payload) -> bool,
) -> Payload {
    for _ in 0..20 {
        let payload = recv_payload(stream).await;
        if want(&payload) {
            return payload;
        }
    }
    panic!("did not see the expected payload within 20 frames");
}

#[tokio::test]
async fn join_then_add_clip_fans_out_clip_id_mapping() {
    let (addr, _state) = spawn_server().await;
    let mut ws = connect(addr).await;

    ws.send(send(Envelope::new(Payload::JoinMatch {
        match_id: "match-1".to_string(),
        user_id: "u1".to_string(),
        username: "Alice".to_string(),
        user_image: None,
        highlight_color: Some("#ff0000".to_string()),
    })))
    .await
    .unwrap();

    ws.send(send(Envelope::new(Payload::ClipAdded {
        match_id: "match-1".to_string(),
        track_id: "track-1".to_string(),
        clip: Clip {
            id: "clip-abc".to_string(),
            kind: ClipKind::Video,
            start_time: 0.0,
            duration: 5.0,
            source_in: 0.0,
            source_duration: 5.0,
            src: "clip.mp4".to_string(),
            name: "clip".to_string(),
            thumbnail: None,
            properties: ClipProperties::default(),
        },
        added_by: "u1".to_string(),
    })))
    .await
    .unwrap();

    let mapping = recv_until(&mut ws, |p| matches!(p, Payload::ClipIdMapping { .. })).await;
    match mapping {
        Payload::ClipIdMapping { mappings, .. } => {
            assert_eq!(mappings.len(), 1);
            assert_eq!(mappings[0].full_id, "clip-abc");
        }
        other => panic!("expected ClipIdMapping, got {other:?}"),
    }
}

#[tokio::test]
async fn rapid_clip_updates_coalesce_into_a_single_batch() {
    let (addr, _state) = spawn_server().await;
    let mut sender = connect(addr).await;
    let mut observer = connect(addr).await;

    for (conn, user) in [(&mut sender, "u1"), (&mut observer, "u2")] {
        conn.send(send(Envelope::new(Payload::JoinMatch {
            match_id: "match-1".to_string(),
            user_id: user.to_string(),
            username: user.to_string(),
            user_image: None,
            highlight_color: None,
        })))
        .await
        .unwrap();
    }

    sender
        .send(send(Envelope::new(Payload::ClipAdded {
            match_id: "match-1".to_string(),
            track_id: "track-1".to_string(),
            clip: Clip {
                id: "clip-abc".to_string(),
                kind: ClipKind::Video,
                start_time: 0.0,
                duration: 5.0,
                source_in: 0.0,
                source_duration: 5.0,
                src: "clip.mp4".to_string(),
                name: "clip".to_string(),
                thumbnail: None,
                properties: ClipProperties::default(),
            },
            added_by: "u1".to_string(),
        })))
        .await
        .unwrap();

    let mapping = recv_until(&mut sender, |p| matches!(p, Payload::ClipIdMapping { .. })).await;
    let short_id = match mapping {
        Payload::ClipIdMapping { mappings, .. } => mappings[0].short_id,
        other => panic!("expected ClipIdMapping, got {other:?}"),
    };

    for start_time in [1.0, 1.5, 2.0, 2.5, 3.0] {
        sender
            .send(send(Envelope::new(Payload::ClipUpdated {
                match_id: "match-1".to_string(),
                track_id: "track-1".to_string(),
                clip_id: "clip-abc".to_string(),
                updates: ClipDelta {
                    short_id,
                    start_time: Some(start_time),
                    duration: None,
                    source_in: None,
                    properties: None,
                    new_track_id: None,
                },
                updated_by: "u1".to_string(),
            })))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // the sender never sees its own updates individually or batched back
    let batch = recv_until(&mut observer, |p| matches!(p, Payload::ClipBatchUpdate { .. })).await;
    match batch {
        Payload::ClipBatchUpdate { updates, .. } => {
            assert_eq!(updates.len(), 1);
            assert_eq!(updates[0].start_time, Some(3.0));
        }
        other => panic!("expected a single coalesced ClipBatchUpdate, got {other:?}"),
    }
}

#[tokio::test]
async fn ping_is_answered_with_pong() {
    let (addr, _state) = spawn_server().await;
    let mut ws = connect(addr).await;
    ws.send(send(Envelope::new(Payload::Ping))).await.unwrap();
    assert!(matches!(recv_payload(&mut ws).await, Payload::Pong));
}

#[tokio::test]
async fn health_endpoint_reports_connection_and_match_counts() {
    let (addr, _state) = spawn_server().await;
    let _ws = connect(addr).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let body = reqwest::get(format!("http://{addr}/health")).await.unwrap().text().await.unwrap();
    assert!(body.contains("\"matches\":1"));
}
