//! Lobby subscription bridge.
//!
//! No server-side filtering or paging: a subscriber always gets the full
//! list the external app returns. The set of subscribers itself lives in
//! `ConnectionRegistry`; this module only knows how to fetch and fan a
//! list out to it.

use std::sync::Arc;

use tracing::warn;

use crate::registry::ConnId;
use crate::state::AppState;
use crate::wire::envelope::Envelope;
use crate::wire::messages::{LobbySummary, Payload};

/// `SubscribeLobbies`: joins the subscriber set, then fetches and answers
/// with the current list — just this connection, not a broadcast.
pub async fn subscribe(state: &Arc<AppState>, conn_id: ConnId) {
    state.registry.subscribe_lobbies(conn_id);
    match state.http.get_lobbies(None).await {
        Ok(lobbies) => {
            *state.lobby_subscribers_cache.write().await = lobbies.clone();
            send_to(state, conn_id, lobbies);
        }
        Err(err) => {
            warn!(conn_id, error = %err, "failed to fetch lobby list on subscribe");
        }
    }
}

pub fn unsubscribe(state: &Arc<AppState>, conn_id: ConnId) {
    state.registry.unsubscribe_lobbies(conn_id);
}

/// `/notify/lobbies`: re-fetches the list and broadcasts it to every
/// subscriber, regardless of who triggered the update.
pub async fn refresh_and_broadcast(state: &Arc<AppState>) {
    let lobbies = match state.http.get_lobbies(None).await {
        Ok(lobbies) => lobbies,
        Err(err) => {
            warn!(error = %err, "failed to fetch lobby list for broadcast");
            return;
        }
    };
    *state.lobby_subscribers_cache.write().await = lobbies.clone();
    for conn_id in state.registry.lobby_subscriber_ids() {
        send_to(state, conn_id, lobbies.clone());
    }
}

fn send_to(state: &AppState, conn_id: ConnId, lobbies: Vec<LobbySummary>) {
    let Some(entry) = state.registry.get(conn_id) else {
        return;
    };
    let envelope = Envelope::new(Payload::LobbiesUpdate { lobbies });
    match envelope.encode() {
        Ok(bytes) => {
            entry.send(bytes);
        }
        Err(err) => warn!(conn_id, error = %err, "failed to encode LobbiesUpdate"),
    }
}
