//! Per-connection task.
//!
//! One task owns the socket for its whole lifetime and drives a single
//! `tokio::select!` loop over three sources: incoming WebSocket frames,
//! frames handed to it by other tasks through its registry entry, and its
//! own 50 ms delta-batch timer. This mirrors
//! `yahoo_logic::downstream::handle_socket` — no split reader/writer
//! tasks, one `&mut socket` used directly in both directions.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::HubError;
use crate::lobby;
use crate::registry::{ConnId, ConnectionEntry, OutboundFrame};
use crate::room::{Outbound, Recipient};
use crate::state::AppState;
use crate::wire::envelope::Envelope;
use crate::wire::messages::Payload;

pub async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutboundFrame>();
    let entry = state.registry.register(tx);
    let conn_id = entry.id;
    info!(conn_id, "connection established");

    let mut batch_interval = tokio::time::interval(state.config.batch_window());
    batch_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    batch_interval.tick().await; // first tick fires immediately; discard it

    loop {
        tokio::select! {
            incoming = socket.next() => {
                match incoming {
                    Some(Ok(Message::Binary(bytes))) => {
                        touch_activity(&entry).await;
                        handle_frame(&state, &entry, &bytes).await;
                    }
                    Some(Ok(Message::Text(_))) => {
                        touch_activity(&entry).await;
                        reply_error(&entry, HubError::InvalidMessage("text frames are not accepted".to_string()));
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        touch_activity(&entry).await;
                    }
                    Some(Ok(Message::Close(_))) => break,
                    Some(Err(err)) => {
                        warn!(conn_id, error = %err, "websocket read error");
                        break;
                    }
                    None => break,
                }
            }
            outbound = rx.recv() => {
                match outbound {
                    Some(OutboundFrame::Bytes(bytes)) => {
                        if socket.send(Message::Binary(bytes)).await.is_err() {
                            break;
                        }
                    }
                    Some(OutboundFrame::Ping) => {
                        if socket.send(Message::Ping(Vec::new())).await.is_err() {
                            break;
                        }
                    }
                    Some(OutboundFrame::Close) | None => {
                        let _ = socket.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            _ = batch_interval.tick() => {
                flush_batch(&state, &entry).await;
            }
        }
    }

    cleanup(&state, &entry).await;
    info!(conn_id, "connection closed");
}

async fn touch_activity(entry: &ConnectionEntry) {
    entry.state.lock().await.last_activity = Some(Instant::now());
}

async fn handle_frame(state: &Arc<AppState>, entry: &ConnectionEntry, bytes: &[u8]) {
    let envelope = match Envelope::decode(bytes) {
        Ok(envelope) => envelope,
        Err(err) => {
            reply_error(entry, HubError::from(err));
            return;
        }
    };
    dispatch(state, entry, envelope.payload).await;
}

fn reply_error(entry: &ConnectionEntry, err: HubError) {
    let envelope = Envelope::error(err.code().as_str(), err.to_string());
    match envelope.encode() {
        Ok(bytes) => {
            entry.send(bytes);
        }
        Err(encode_err) => warn!(error = %encode_err, "failed to encode error envelope"),
    }
}

fn reply_direct(entry: &ConnectionEntry, payload: Payload) {
    let envelope = Envelope::new(payload);
    match envelope.encode() {
        Ok(bytes) => {
            entry.send(bytes);
        }
        Err(err) => warn!(error = %err, "failed to encode outbound envelope"),
    }
}

/// Schedules the match's persistence debounce timer without blocking the
/// caller; spawned because `PersistenceScheduler::schedule` itself only
/// does cheap bookkeeping before spawning its own sleeper, but taking the
/// lock inline here would still serialize against other connections.
fn schedule_persistence(state: &Arc<AppState>, match_id: String) {
    let state = state.clone();
    tokio::spawn(async move {
        state.persistence.schedule(state.clone(), match_id).await;
    });
}

async fn dispatch(state: &Arc<AppState>, entry: &ConnectionEntry, payload: Payload) {
    let conn_id = entry.id;
    match payload {
        Payload::Ping => reply_direct(entry, Payload::Pong),
        Payload::Pong => {}

        Payload::SubscribeLobbies => lobby::subscribe(state, conn_id).await,
        Payload::UnsubscribeLobbies => lobby::unsubscribe(state, conn_id),

        Payload::JoinMatch {
            match_id,
            user_id,
            username,
            user_image,
            highlight_color,
        } => handle_join(state, entry, match_id, user_id, username, user_image, highlight_color).await,

        Payload::LeaveMatch { match_id, user_id } => handle_leave(state, entry, match_id, user_id).await,

        Payload::MediaUploaded { match_id, media } => {
            relay_to_others(state, &match_id, conn_id, Payload::MediaUploaded { match_id: match_id.clone(), media }).await;
        }
        Payload::MediaRemoved { match_id, media_id } => {
            relay_to_others(state, &match_id, conn_id, Payload::MediaRemoved { match_id: match_id.clone(), media_id }).await;
        }

        Payload::ClipAdded { match_id, track_id, clip, .. } => {
            handle_result(state, entry, &match_id, |room| room.handle_clip_added(conn_id, track_id, clip)).await;
        }
        Payload::ClipUpdated { match_id, track_id, clip_id, updates, .. } => {
            let Some(room) = state.room(&match_id).await else {
                reply_error(entry, HubError::MatchNotFound(match_id));
                return;
            };
            match room.handle_clip_updated(conn_id, track_id, clip_id, updates) {
                Ok(()) => schedule_persistence(state, match_id),
                Err(err) => reply_error(entry, err),
            }
        }
        Payload::ClipRemoved { match_id, track_id, clip_id, .. } => {
            handle_result(state, entry, &match_id, |room| room.handle_clip_removed(conn_id, track_id, clip_id)).await;
        }
        Payload::ClipSplit { match_id, track_id, original_clip, new_clip, .. } => {
            handle_result(state, entry, &match_id, |room| {
                room.handle_clip_split(conn_id, track_id, original_clip, new_clip)
            })
            .await;
        }
        Payload::ClipBatchUpdate { match_id, updates, .. } => {
            handle_result(state, entry, &match_id, |room| room.handle_batch_update(conn_id, updates)).await;
        }

        Payload::ZoneSubscribe { match_id, start_time, end_time } => {
            let Some(room) = state.room(&match_id).await else {
                reply_error(entry, HubError::MatchNotFound(match_id));
                return;
            };
            match room.handle_zone_subscribe(conn_id, start_time, end_time) {
                Ok(outbound) => state.deliver(&match_id, vec![outbound]).await,
                Err(err) => reply_error(entry, err),
            }
        }

        Payload::ClipSelection {
            match_id,
            user_id,
            username,
            user_image,
            highlight_color,
            selected_clips,
        } => {
            relay_to_others(
                state,
                &match_id,
                conn_id,
                Payload::ClipSelection {
                    match_id: match_id.clone(),
                    user_id,
                    username,
                    user_image,
                    highlight_color,
                    selected_clips,
                },
            )
            .await;
        }

        Payload::TimelineSync { match_id, timeline } => {
            if let Some(room) = state.room(&match_id).await {
                room.apply_full_sync(timeline.clone());
            }
            state.persistence.resolve(&match_id, timeline).await;
        }
        Payload::RequestTimelineSync { .. } => {
            // Server-originated only; a client sending this is a protocol misuse, ignored.
        }

        Payload::ChatMessage { match_id, message } => handle_chat(state, entry, match_id, message).await,

        // Server-to-client-only payloads received from a client are protocol
        // misuse; logged and dropped rather than torn down, in case of a
        // future client version skew.
        Payload::LobbiesUpdate { .. }
        | Payload::ClipIdMapping { .. }
        | Payload::ZoneClips { .. }
        | Payload::ChatBroadcast { .. }
        | Payload::PlayerCount { .. }
        | Payload::PlayerJoined { .. }
        | Payload::PlayerLeft { .. }
        | Payload::MatchStatus { .. }
        | Payload::Error { .. } => {
            warn!(conn_id, "received a server-only payload from a client; ignoring");
        }
    }
}

async fn relay_to_others(state: &Arc<AppState>, match_id: &str, sender: ConnId, payload: Payload) {
    state.deliver(match_id, vec![outbound_all_except(sender, Envelope::new(payload))]).await;
}

fn outbound_all_except(sender: ConnId, envelope: Envelope) -> Outbound {
    Outbound {
        recipient: Recipient::AllExcept(sender),
        envelope,
    }
}

async fn handle_result<F>(state: &Arc<AppState>, entry: &ConnectionEntry, match_id: &str, op: F)
where
    F: FnOnce(&crate::room::MatchRoom) -> Result<Vec<Outbound>, HubError>,
{
    let Some(room) = state.room(match_id).await else {
        reply_error(entry, HubError::MatchNotFound(match_id.to_string()));
        return;
    };
    match op(&room) {
        Ok(outbound) => {
            state.deliver(match_id, outbound).await;
            schedule_persistence(state, match_id.to_string());
        }
        Err(err) => reply_error(entry, err),
    }
}

async fn handle_join(
    state: &Arc<AppState>,
    entry: &ConnectionEntry,
    match_id: String,
    user_id: String,
    username: String,
    user_image: Option<String>,
    highlight_color: Option<String>,
) {
    let conn_id = entry.id;
    state.evict_user_from_other_matches(&user_id, &match_id, conn_id).await;

    let room = state.get_or_create_room(&match_id).await;
    match room.join(conn_id, user_id.clone(), username.clone(), user_image.clone(), highlight_color.clone()) {
        Ok(outcome) => {
            {
                let mut conn_state = entry.state.lock().await;
                conn_state.user_id = Some(user_id.clone());
                conn_state.username = Some(username);
                conn_state.user_image = user_image;
                conn_state.highlight_color = highlight_color;
                conn_state.match_id = Some(match_id.clone());
            }
            state.registry.bind_user(conn_id, &user_id);
            for evicted in outcome.evicted {
                state.clear_match_id(evicted).await;
            }
            state.deliver(&match_id, outcome.outbound).await;
            state.refresh_config_if_missing(&room, &match_id).await;
            notify_join(state, match_id, user_id);
        }
        Err(err) => reply_error(entry, err),
    }
}

async fn handle_leave(state: &Arc<AppState>, entry: &ConnectionEntry, match_id: String, user_id: String) {
    let conn_id = entry.id;
    if let Some(room) = state.room(&match_id).await {
        let outbound = room.leave(conn_id);
        state.deliver(&match_id, outbound).await;
        state.teardown_room_if_empty(&match_id).await;
    }
    state.clear_match_id(conn_id).await;
    notify_leave(state, match_id, user_id);
}

async fn handle_chat(state: &Arc<AppState>, entry: &ConnectionEntry, match_id: String, message: String) {
    let Some(room) = state.room(&match_id).await else {
        reply_error(entry, HubError::MatchNotFound(match_id));
        return;
    };
    let expiry = state.config.vote_kick_expiry();
    match room.handle_chat_message(entry.id, &message, Instant::now(), expiry) {
        Ok(outcome) => {
            state.deliver(&match_id, outcome.outbound).await;
            for kicked_conn in room.banned_member_conns() {
                if let Some(kicked_entry) = state.registry.get(kicked_conn) {
                    reply_error(&kicked_entry, HubError::VoteKicked(match_id.clone()));
                    kicked_entry.close();
                }
            }
            if let Some(vote_id) = outcome.armed_vote {
                arm_vote_kick_expiry(state, match_id, vote_id, expiry);
            }
        }
        Err(err) => reply_error(entry, err),
    }
}

/// Spawns the 30 s expiry timer a freshly-armed vote-kick needs.
/// `expire_vote_if_matching` is idempotent against a vote that already
/// resolved (by vote, or by a second `!kick` reusing an expired slot), so
/// this timer firing late or after the vote was already settled is a no-op.
fn arm_vote_kick_expiry(state: &Arc<AppState>, match_id: String, vote_id: String, expiry: std::time::Duration) {
    let state = state.clone();
    tokio::spawn(async move {
        tokio::time::sleep(expiry).await;
        let Some(room) = state.room(&match_id).await else {
            return;
        };
        if let Some(outbound) = room.expire_vote_if_matching(&vote_id, Instant::now(), expiry) {
            state.deliver(&match_id, outbound).await;
        }
    });
}

fn notify_join(state: &Arc<AppState>, match_id: String, user_id: String) {
    let state = state.clone();
    tokio::spawn(async move {
        if let Err(err) = state.http.notify_join(&match_id, &user_id).await {
            crate::http_client::log_external_error("notify_join", err);
        }
    });
}

fn notify_leave(state: &Arc<AppState>, match_id: String, user_id: String) {
    let state = state.clone();
    tokio::spawn(async move {
        if let Err(err) = state.http.notify_leave(&match_id, &user_id).await {
            crate::http_client::log_external_error("notify_leave", err);
        }
    });
}

async fn flush_batch(state: &Arc<AppState>, entry: &ConnectionEntry) {
    let conn_id = entry.id;
    let match_id = entry.state.lock().await.match_id.clone();
    let Some(match_id) = match_id else { return };
    let Some(room) = state.room(&match_id).await else { return };
    let Some(updates) = room.drain_batch(conn_id) else { return };
    let user_id = entry.state.lock().await.user_id.clone().unwrap_or_default();
    let outbound = vec![outbound_all_except(
        conn_id,
        Envelope::new(Payload::ClipBatchUpdate {
            match_id: match_id.clone(),
            updates,
            updated_by: user_id,
        }),
    )];
    state.deliver(&match_id, outbound).await;
}

async fn cleanup(state: &Arc<AppState>, entry: &ConnectionEntry) {
    let conn_id = entry.id;
    let (match_id, user_id) = {
        let conn_state = entry.state.lock().await;
        (conn_state.match_id.clone(), conn_state.user_id.clone())
    };
    if let Some(match_id) = match_id {
        if let Some(room) = state.room(&match_id).await {
            room.discard_batch(conn_id);
            let outbound = room.leave(conn_id);
            state.deliver(&match_id, outbound).await;
            state.teardown_room_if_empty(&match_id).await;
        }
        if let Some(user_id) = user_id {
            notify_leave(state, match_id, user_id);
        }
    }
    state.registry.unregister(conn_id).await;
}
