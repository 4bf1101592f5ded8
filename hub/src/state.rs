//! Process-global shared state, analogous in shape to
//! `yahoo_logic::state::AppState` but fanned out over match rooms instead of
//! a single symbol table: a connection registry, the live match rooms keyed
//! by match id, the lobby-subscriber bridge, the external HTTP client, and
//! the per-match persistence debouncer.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::Config;
use crate::http_client::{log_external_error, ExternalApiClient};
use crate::persistence::PersistenceScheduler;
use crate::registry::{ConnId, ConnectionRegistry};
use crate::room::{MatchRoom, Outbound, Recipient, RoomLimits};
use crate::validator::MatchConfig;
use crate::wire::messages::TrackSnapshot;

pub struct AppState {
    pub config: Arc<Config>,
    pub registry: ConnectionRegistry,
    pub rooms: RwLock<HashMap<String, Arc<MatchRoom>>>,
    pub http: ExternalApiClient,
    pub persistence: PersistenceScheduler,
    pub lobby_subscribers_cache: RwLock<Vec<crate::wire::messages::LobbySummary>>,
}

impl AppState {
    pub fn new(config: Config) -> Arc<Self> {
        let config = Arc::new(config);
        let http = ExternalApiClient::new(config.api_base_url.clone(), config.external_app_token.clone());
        Arc::new(AppState {
            persistence: PersistenceScheduler::new(config.persist_debounce()),
            config,
            registry: ConnectionRegistry::new(),
            rooms: RwLock::new(HashMap::new()),
            http,
            lobby_subscribers_cache: RwLock::new(Vec::new()),
        })
    }

    pub async fn room(&self, match_id: &str) -> Option<Arc<MatchRoom>> {
        self.rooms.read().await.get(match_id).cloned()
    }

    /// Returns the room for `match_id`, fetching its config/timeline skeleton
    /// from the external app and creating it if this is the first join.
    pub async fn get_or_create_room(&self, match_id: &str) -> Arc<MatchRoom> {
        if let Some(room) = self.room(match_id).await {
            return room;
        }
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(match_id) {
            return room.clone();
        }

        let (duration, tracks, config) = match self.http.get_match_config(match_id).await {
            Ok(resp) => (resp.duration, resp.tracks, Some(resp.config)),
            Err(err) => {
                // Spec §7: "If config cannot be fetched, validation degrades
                // to accept and continues" — create an empty, unconstrained
                // timeline rather than refusing the join outright.
                warn!(match_id, error = %err, "failed to fetch match config; starting unconfigured room");
                (0.0, default_tracks(), None)
            }
        };

        let limits = RoomLimits {
            chat_rate_window: self.config.chat_rate_window(),
            chat_rate_max: self.config.chat_rate_max,
            chat_history_cap: self.config.chat_history_cap,
            zone_buffer_secs: self.config.zone_buffer_secs,
        };
        let room = Arc::new(MatchRoom::with_limits(match_id.to_string(), duration, tracks, limits));
        if let Some(cfg) = config {
            room.set_config(cfg);
        }
        rooms.insert(match_id.to_string(), room.clone());
        room
    }

    /// Tears down a room once it has emptied. Cancels its persistence timer
    /// so no `RequestTimelineSync` fires against a room with no one to
    /// answer it.
    pub async fn teardown_room_if_empty(&self, match_id: &str) {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(match_id) {
            if room.is_empty() {
                rooms.remove(match_id);
                self.persistence.cancel(match_id).await;
                info!(match_id, "match room torn down (last member left)");
            }
        }
    }

    /// Re-fetches and patches the latest config onto a room whose config was
    /// missing at creation time (external app came back up). Best-effort.
    pub async fn refresh_config_if_missing(&self, room: &MatchRoom, match_id: &str) {
        if room.has_config() {
            return;
        }
        match self.http.get_match_config(match_id).await {
            Ok(resp) => room.set_config(resp.config),
            Err(err) => log_external_error("refresh_config_if_missing", err),
        }
    }

    /// Resolves a room's `Outbound` batch into real connections and pushes
    /// the encoded frames onto each one's channel. `Recipient::All`/
    /// `AllExcept` are resolved against the room's *current* membership, so
    /// this must run after the mutation that produced `outbound` has
    /// already been applied to the room.
    pub async fn deliver(&self, match_id: &str, outbound: Vec<Outbound>) {
        if outbound.is_empty() {
            return;
        }
        let Some(room) = self.room(match_id).await else {
            return;
        };
        for item in outbound {
            let targets: Vec<ConnId> = match item.recipient {
                Recipient::All => room.member_conn_ids(),
                Recipient::AllExcept(id) => room
                    .member_conn_ids()
                    .into_iter()
                    .filter(|conn| *conn != id)
                    .collect(),
                Recipient::Conn(id) => vec![id],
            };
            let bytes = match item.envelope.encode() {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(match_id, error = %err, "failed to encode outbound envelope");
                    continue;
                }
            };
            for conn_id in targets {
                if let Some(entry) = self.registry.get(conn_id) {
                    entry.send(bytes.clone());
                }
            }
        }
    }

    /// Clears a connection's tracked match membership without touching its
    /// socket, used when it has been evicted (same- or cross-match) but
    /// stays connected.
    pub async fn clear_match_id(&self, conn_id: ConnId) {
        if let Some(entry) = self.registry.get(conn_id) {
            entry.state.lock().await.match_id = None;
        }
    }

    /// Cross-match half of same-user eviction: if another conn of the same
    /// user is in *any* other match, silently evicts it. The same-room half
    /// is `MatchRoom::join`'s `JoinOutcome::evicted`.
    pub async fn evict_user_from_other_matches(&self, user_id: &str, new_match_id: &str, new_conn_id: ConnId) {
        for conn_id in self.registry.connections_for_user(user_id) {
            if conn_id == new_conn_id {
                continue;
            }
            let old_match_id = match self.registry.get(conn_id) {
                Some(entry) => entry.state.lock().await.match_id.take(),
                None => continue,
            };
            let Some(old_match_id) = old_match_id else {
                continue;
            };
            if old_match_id == new_match_id {
                continue;
            }
            if let Some(room) = self.room(&old_match_id).await {
                let outbound = room.leave(conn_id);
                self.deliver(&old_match_id, outbound).await;
                self.teardown_room_if_empty(&old_match_id).await;
            }
        }
    }
}

fn default_tracks() -> Vec<TrackSnapshot> {
    Vec::new()
}

/// Default config used nowhere at runtime; kept so `MatchConfig` has a
/// documented "no constraints" shape for tests.
#[cfg(test)]
pub fn unconstrained_config() -> MatchConfig {
    MatchConfig {
        clip_size_min: 0.0,
        clip_size_max: f64::MAX,
        audio_max_db: f64::MAX,
        max_video_tracks: u32::MAX,
        max_audio_tracks: u32::MAX,
        max_clips_per_user: 0,
        constraints: Vec::new(),
    }
}
