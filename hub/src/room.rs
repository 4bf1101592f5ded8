//! Per-match room: member set, cache, clip-id map, chat, vote-kick.
//!
//! A room's state is guarded by a single `std::sync::Mutex`, not a `tokio`
//! one: every operation below is synchronous (map mutation, cache edits,
//! non-blocking channel sends). HTTP calls and timers live outside this
//! struct, in `persistence.rs`/`connection.rs`, so the lock is never held
//! across an `.await`. This mirrors `yahoo_logic::state::AppState`, whose
//! `client_subscriptions`/`symbol_counts` maps are guarded the same way.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::batcher::DeltaBatcher;
use crate::chat::{
    self, ChatEntry, ChatHistory, KickQueryResult, RateLimiter, VoteKick, VoteOutcome, SYSTEM_USER_ID,
};
use crate::clip_id::ClipIdAllocator;
use crate::error::HubError;
use crate::registry::ConnId;
use crate::timeline_cache::{CacheError, TimelineCache};
use crate::validator::{self, MatchConfig, ValidationInput};
use crate::wire::envelope::Envelope;
use crate::wire::messages::{
    Clip, ClipDelta, ClipIdMappingEntry, ClipKind, MatchStatusKind, Payload, TrackKind,
};
use crate::zone::{self, Zone};

const DEFAULT_ZONE_BUFFER_SECS: f64 = 2.0;

#[derive(Debug, Clone, Default)]
pub struct MemberIdentity {
    pub user_id: String,
    pub username: String,
    pub user_image: Option<String>,
    pub highlight_color: String,
}

/// Who an outbound envelope should reach.
#[derive(Debug, Clone, Copy)]
pub enum Recipient {
    All,
    AllExcept(ConnId),
    Conn(ConnId),
}

#[derive(Debug, Clone)]
pub struct Outbound {
    pub recipient: Recipient,
    pub envelope: Envelope,
}

impl Outbound {
    fn to(conn: ConnId, envelope: Envelope) -> Self {
        Outbound {
            recipient: Recipient::Conn(conn),
            envelope,
        }
    }

    fn all_except(conn: ConnId, envelope: Envelope) -> Self {
        Outbound {
            recipient: Recipient::AllExcept(conn),
            envelope,
        }
    }

    fn all(envelope: Envelope) -> Self {
        Outbound {
            recipient: Recipient::All,
            envelope,
        }
    }
}

/// Result of a chat message: what to broadcast, and, if the message just
/// armed a new vote-kick, the `vote_id` the caller must schedule an expiry
/// timer for (the room itself has no access to a timer/runtime).
pub struct ChatOutcome {
    pub outbound: Vec<Outbound>,
    pub armed_vote: Option<String>,
}

pub struct JoinOutcome {
    pub outbound: Vec<Outbound>,
    /// Non-empty if another connection of the same user was evicted from
    /// this room as a side effect (same-room half of eviction; the
    /// cross-match half is handled by the caller via `ConnectionRegistry`).
    pub evicted: Vec<ConnId>,
}

/// Tunables a room needs at construction time that otherwise would be
/// hardcoded constants; lets `Config` override them without the room module
/// reaching into `config.rs` directly.
#[derive(Debug, Clone, Copy)]
pub struct RoomLimits {
    pub chat_rate_window: Duration,
    pub chat_rate_max: u32,
    pub chat_history_cap: usize,
    pub zone_buffer_secs: f64,
}

impl Default for RoomLimits {
    fn default() -> Self {
        RoomLimits {
            chat_rate_window: Duration::from_secs(10),
            chat_rate_max: 5,
            chat_history_cap: chat::CHAT_HISTORY_CAP,
            zone_buffer_secs: DEFAULT_ZONE_BUFFER_SECS,
        }
    }
}

pub struct MatchRoom {
    pub match_id: String,
    limits: RoomLimits,
    state: std::sync::Mutex<RoomState>,
}

struct RoomState {
    member_conn_ids: HashSet<ConnId>,
    member_identity: HashMap<ConnId, MemberIdentity>,
    cache: TimelineCache,
    config: Option<MatchConfig>,
    clip_ids: ClipIdAllocator,
    player_clip_count: HashMap<String, u32>,
    chat_history: ChatHistory,
    banned_users: HashSet<String>,
    active_vote_kick: Option<VoteKick>,
    edit_count: u64,
    zones: HashMap<ConnId, Zone>,
    rate_limiters: HashMap<ConnId, RateLimiter>,
    batchers: HashMap<ConnId, DeltaBatcher>,
    next_vote_id: u64,
}

impl MatchRoom {
    pub fn new(match_id: String, duration: f64, tracks: Vec<crate::wire::messages::TrackSnapshot>) -> Self {
        Self::with_limits(match_id, duration, tracks, RoomLimits::default())
    }

    pub fn with_limits(
        match_id: String,
        duration: f64,
        tracks: Vec<crate::wire::messages::TrackSnapshot>,
        limits: RoomLimits,
    ) -> Self {
        MatchRoom {
            match_id,
            limits,
            state: std::sync::Mutex::new(RoomState {
                member_conn_ids: HashSet::new(),
                member_identity: HashMap::new(),
                cache: TimelineCache::new(duration, tracks),
                config: None,
                clip_ids: ClipIdAllocator::new(),
                player_clip_count: HashMap::new(),
                chat_history: ChatHistory::new(limits.chat_history_cap),
                banned_users: HashSet::new(),
                active_vote_kick: None,
                edit_count: 0,
                zones: HashMap::new(),
                rate_limiters: HashMap::new(),
                batchers: HashMap::new(),
                next_vote_id: 1,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RoomState> {
        self.state.lock().expect("match room lock poisoned")
    }

    pub fn set_config(&self, config: MatchConfig) {
        self.lock().config = Some(config);
    }

    pub fn has_config(&self) -> bool {
        self.lock().config.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().member_conn_ids.is_empty()
    }

    pub fn member_count(&self) -> u32 {
        self.lock().member_identity.len() as u32
    }

    pub fn member_conn_ids(&self) -> Vec<ConnId> {
        self.lock().member_conn_ids.iter().copied().collect()
    }

    pub fn edit_count(&self) -> u64 {
        self.lock().edit_count
    }

    pub fn first_member(&self) -> Option<ConnId> {
        self.lock().member_conn_ids.iter().min().copied()
    }

    pub fn is_banned(&self, user_id: &str) -> bool {
        self.lock().banned_users.contains(user_id)
    }

    /// Eviction of a same-user connection already in
    /// *this* room is returned in `JoinOutcome::evicted` for the caller to
    /// tear down; eviction from *other* rooms is the caller's job since this
    /// type only knows about its own room.
    pub fn join(
        &self,
        conn_id: ConnId,
        user_id: String,
        username: String,
        user_image: Option<String>,
        highlight_color: Option<String>,
    ) -> Result<JoinOutcome, HubError> {
        let mut state = self.lock();
        if state.banned_users.contains(&user_id) {
            return Err(HubError::VoteKicked(self.match_id.clone()));
        }

        let evicted: Vec<ConnId> = state
            .member_identity
            .iter()
            .filter(|(_, identity)| identity.user_id == user_id)
            .map(|(conn, _)| *conn)
            .collect();
        let mut outbound = Vec::new();
        for evicted_conn in &evicted {
            state.member_conn_ids.remove(evicted_conn);
            state.member_identity.remove(evicted_conn);
            state.zones.remove(evicted_conn);
            state.batchers.remove(evicted_conn);
            state.rate_limiters.remove(evicted_conn);
            outbound.push(Outbound::all(Envelope::new(Payload::PlayerLeft {
                match_id: self.match_id.clone(),
                user_id: user_id.clone(),
            })));
        }

        let highlight_color = highlight_color.unwrap_or_else(|| "#888888".to_string());
        state.member_conn_ids.insert(conn_id);
        state.member_identity.insert(
            conn_id,
            MemberIdentity {
                user_id: user_id.clone(),
                username: username.clone(),
                user_image: user_image.clone(),
                highlight_color,
            },
        );
        state.rate_limiters.insert(
            conn_id,
            RateLimiter::new(self.limits.chat_rate_window, self.limits.chat_rate_max),
        );
        state.batchers.insert(conn_id, DeltaBatcher::new());

        let player_count = state.member_identity.len() as u32;
        outbound.push(Outbound::to(
            conn_id,
            Envelope::new(Payload::PlayerCount {
                match_id: self.match_id.clone(),
                count: player_count,
            }),
        ));
        outbound.push(Outbound::all_except(
            conn_id,
            Envelope::new(Payload::PlayerJoined {
                match_id: self.match_id.clone(),
                user_id,
                username,
                user_image,
                highlight_color: None,
            }),
        ));
        for entry in state.chat_history.snapshot() {
            outbound.push(Outbound::to(
                conn_id,
                Envelope::new(Payload::ChatBroadcast {
                    match_id: self.match_id.clone(),
                    message_id: entry.message_id,
                    user_id: entry.user_id,
                    username: entry.username,
                    user_image: entry.user_image,
                    highlight_color: entry.highlight_color,
                    message: entry.message,
                    timestamp: entry.timestamp,
                }),
            ));
        }

        Ok(JoinOutcome { outbound, evicted })
    }

    pub fn leave(&self, conn_id: ConnId) -> Vec<Outbound> {
        let mut state = self.lock();
        let identity = state.member_identity.remove(&conn_id);
        state.member_conn_ids.remove(&conn_id);
        state.zones.remove(&conn_id);
        state.batchers.remove(&conn_id);
        state.rate_limiters.remove(&conn_id);

        match identity {
            Some(identity) => vec![Outbound::all(Envelope::new(Payload::PlayerLeft {
                match_id: self.match_id.clone(),
                user_id: identity.user_id,
            }))],
            None => Vec::new(),
        }
    }

    fn member_user_id(state: &RoomState, conn_id: ConnId) -> Option<String> {
        state.member_identity.get(&conn_id).map(|i| i.user_id.clone())
    }

    pub fn handle_clip_added(
        &self,
        conn_id: ConnId,
        track_id: String,
        clip: Clip,
    ) -> Result<Vec<Outbound>, HubError> {
        let mut state = self.lock();
        if !state.member_conn_ids.contains(&conn_id) {
            return Err(HubError::NotInMatch(self.match_id.clone()));
        }
        let user_id = Self::member_user_id(&state, conn_id)
            .ok_or_else(|| HubError::NotInMatch(self.match_id.clone()))?;

        let track_kind = state
            .cache
            .track_kind(&track_id)
            .ok_or_else(|| HubError::TrackNotFound(track_id.clone()))?;
        if !kind_compatible(clip.kind, track_kind) {
            return Err(HubError::TrackTypeMismatch);
        }

        if let Some(config) = state.config.clone() {
            let next_count = state.player_clip_count.get(&user_id).copied().unwrap_or(0) + 1;
            let input = ValidationInput {
                clip: &clip,
                track_kind,
                is_new_for_user: true,
                user_clip_count_after: next_count,
            };
            let result = validator::validate(&input, &config, &state.cache);
            if !result.valid {
                return Err(HubError::ConstraintViolation(
                    result.reason.unwrap_or_default(),
                ));
            }
        }

        state
            .cache
            .add_clip(&track_id, clip.clone())
            .map_err(cache_error)?;
        let short_id = state.clip_ids.allocate(&clip.id, &track_id);
        *state.player_clip_count.entry(user_id.clone()).or_insert(0) += 1;
        state.edit_count += 1;

        let mapping = ClipIdMappingEntry {
            short_id,
            full_id: clip.id.clone(),
            track_id: track_id.clone(),
            kind: clip.kind,
        };
        let mut outbound = vec![Outbound::all(Envelope::new(Payload::ClipIdMapping {
            match_id: self.match_id.clone(),
            mappings: vec![mapping],
        }))];

        outbound.extend(self.zone_filtered_fanout(
            &state,
            conn_id,
            clip.start_time,
            clip.duration,
            Envelope::new(Payload::ClipAdded {
                match_id: self.match_id.clone(),
                track_id,
                clip,
                added_by: user_id,
            }),
        ));

        Ok(outbound)
    }

    /// A client-submitted `ClipUpdated` validates and applies against the
    /// cache immediately, but is never broadcast as an individual envelope:
    /// it is folded into the sender's delta batcher instead,
    /// and goes out later as part of a `ClipBatchUpdate` when that 50 ms
    /// window fires. `_track_id` is accepted for wire symmetry with the
    /// client's message but isn't trusted — the cache resolves the clip's
    /// real current track independently.
    pub fn handle_clip_updated(
        &self,
        conn_id: ConnId,
        _track_id: String,
        clip_id: String,
        updates: ClipDelta,
    ) -> Result<(), HubError> {
        let mut state = self.lock();
        if !state.member_conn_ids.contains(&conn_id) {
            return Err(HubError::NotInMatch(self.match_id.clone()));
        }

        let (_current_track, existing) = state
            .cache
            .find_clip(&clip_id)
            .map(|(t, c)| (t.to_string(), c.clone()))
            .ok_or_else(|| HubError::ClipNotFound(clip_id.clone(), _track_id.clone()))?;
        let dest_track = updates
            .new_track_id
            .clone()
            .unwrap_or_else(|| _current_track.clone());
        let track_kind = state
            .cache
            .track_kind(&dest_track)
            .ok_or_else(|| HubError::TrackNotFound(dest_track.clone()))?;

        let mut resolved = existing.clone();
        if let Some(v) = updates.start_time {
            resolved.start_time = v;
        }
        if let Some(v) = updates.duration {
            resolved.duration = v;
        }
        if let Some(v) = updates.source_in {
            resolved.source_in = v;
        }
        resolved = validator::resolve_update(resolved, updates.properties.as_ref());

        if let Some(config) = state.config.clone() {
            let input = ValidationInput {
                clip: &resolved,
                track_kind,
                is_new_for_user: false,
                user_clip_count_after: 0,
            };
            let result = validator::validate(&input, &config, &state.cache);
            if !result.valid {
                return Err(HubError::ConstraintViolation(
                    result.reason.unwrap_or_default(),
                ));
            }
        }

        let new_track_param = updates.new_track_id.as_deref();
        state
            .cache
            .update_clip(&clip_id, new_track_param, |c| *c = resolved.clone())
            .map_err(cache_error)?;
        let short_id = state.clip_ids.short_for(&clip_id).unwrap_or(0);
        if let Some(new_track) = &updates.new_track_id {
            state.clip_ids.retarget(short_id, new_track);
        }
        state.edit_count += 1;

        if let Some(batcher) = state.batchers.get_mut(&conn_id) {
            batcher.merge(&clip_id, short_id, &updates);
        }
        Ok(())
    }

    pub fn handle_clip_removed(
        &self,
        conn_id: ConnId,
        track_id: String,
        clip_id: String,
    ) -> Result<Vec<Outbound>, HubError> {
        let mut state = self.lock();
        if !state.member_conn_ids.contains(&conn_id) {
            return Err(HubError::NotInMatch(self.match_id.clone()));
        }
        let user_id = Self::member_user_id(&state, conn_id)
            .ok_or_else(|| HubError::NotInMatch(self.match_id.clone()))?;

        let removed = state.cache.remove_clip(&clip_id).map_err(cache_error)?;
        state.clip_ids.remove(&clip_id);
        if let Some(count) = state.player_clip_count.get_mut(&user_id) {
            *count = count.saturating_sub(1);
        }
        state.edit_count += 1;

        let outbound = self.zone_filtered_fanout(
            &state,
            conn_id,
            removed.start_time,
            removed.duration,
            Envelope::new(Payload::ClipRemoved {
                match_id: self.match_id.clone(),
                track_id,
                clip_id,
                removed_by: user_id,
            }),
        );
        Ok(outbound)
    }

    pub fn handle_clip_split(
        &self,
        conn_id: ConnId,
        track_id: String,
        original_clip: Clip,
        new_clip: Clip,
    ) -> Result<Vec<Outbound>, HubError> {
        let mut state = self.lock();
        if !state.member_conn_ids.contains(&conn_id) {
            return Err(HubError::NotInMatch(self.match_id.clone()));
        }
        let user_id = Self::member_user_id(&state, conn_id)
            .ok_or_else(|| HubError::NotInMatch(self.match_id.clone()))?;

        let track_kind = state
            .cache
            .track_kind(&track_id)
            .ok_or_else(|| HubError::TrackNotFound(track_id.clone()))?;

        if let Some(config) = state.config.clone() {
            let next_count = state.player_clip_count.get(&user_id).copied().unwrap_or(0) + 1;
            let orig_input = ValidationInput {
                clip: &original_clip,
                track_kind,
                is_new_for_user: false,
                user_clip_count_after: 0,
            };
            let new_input = ValidationInput {
                clip: &new_clip,
                track_kind,
                is_new_for_user: true,
                user_clip_count_after: next_count,
            };
            let result = validator::validate_split(&orig_input, &new_input, &config, &state.cache);
            if !result.valid {
                return Err(HubError::ConstraintViolation(
                    result.reason.unwrap_or_default(),
                ));
            }
        }

        state
            .cache
            .split(&track_id, original_clip.clone(), new_clip.clone())
            .map_err(cache_error)?;
        let new_short = state.clip_ids.allocate(&new_clip.id, &track_id);
        *state.player_clip_count.entry(user_id.clone()).or_insert(0) += 1;
        state.edit_count += 1;

        let mapping = ClipIdMappingEntry {
            short_id: new_short,
            full_id: new_clip.id.clone(),
            track_id: track_id.clone(),
            kind: new_clip.kind,
        };
        let mut outbound = vec![Outbound::all(Envelope::new(Payload::ClipIdMapping {
            match_id: self.match_id.clone(),
            mappings: vec![mapping],
        }))];
        outbound.extend(self.zone_filtered_fanout(
            &state,
            conn_id,
            original_clip.start_time,
            original_clip.duration,
            Envelope::new(Payload::ClipSplit {
                match_id: self.match_id.clone(),
                track_id,
                original_clip,
                new_clip,
                split_by: user_id,
            }),
        ));
        Ok(outbound)
    }

    /// Per-connection delta batcher entry point: merges the update into that
    /// connection's pending batch rather than fanning out immediately. The
    /// caller (`connection.rs`) owns the 50 ms timer that later calls
    /// `drain_batch`.
    pub fn buffer_batched_update(&self, conn_id: ConnId, clip_id: &str, short_id: u32, delta: &ClipDelta) {
        let mut state = self.lock();
        if let Some(batcher) = state.batchers.get_mut(&conn_id) {
            batcher.merge(clip_id, short_id, delta);
        }
    }

    pub fn drain_batch(&self, conn_id: ConnId) -> Option<Vec<ClipDelta>> {
        let mut state = self.lock();
        let batcher = state.batchers.get_mut(&conn_id)?;
        if batcher.is_empty() {
            return None;
        }
        Some(batcher.drain())
    }

    pub fn discard_batch(&self, conn_id: ConnId) {
        let mut state = self.lock();
        if let Some(batcher) = state.batchers.get_mut(&conn_id) {
            batcher.discard();
        }
    }

    /// Applies a client-submitted `ClipBatchUpdate` atomically: any single
    /// delta failing validation aborts the whole batch.
    pub fn handle_batch_update(
        &self,
        conn_id: ConnId,
        updates: Vec<ClipDelta>,
    ) -> Result<Vec<Outbound>, HubError> {
        let mut state = self.lock();
        if !state.member_conn_ids.contains(&conn_id) {
            return Err(HubError::NotInMatch(self.match_id.clone()));
        }
        let user_id = Self::member_user_id(&state, conn_id)
            .ok_or_else(|| HubError::NotInMatch(self.match_id.clone()))?;

        for delta in &updates {
            let entry = match state.clip_ids.resolve(delta.short_id) {
                Some(e) => e.clone(),
                None => {
                    warn!(short_id = delta.short_id, "batch delta references unknown short id, skipping");
                    continue;
                }
            };
            let dest_track = delta.new_track_id.clone().unwrap_or(entry.track_id.clone());
            let track_kind = state
                .cache
                .track_kind(&dest_track)
                .ok_or_else(|| HubError::TrackNotFound(dest_track.clone()))?;
            let (_, existing) = state
                .cache
                .find_clip(&entry.full_id)
                .map(|(t, c)| (t.to_string(), c.clone()))
                .ok_or_else(|| HubError::ClipNotFound(entry.full_id.clone(), dest_track.clone()))?;
            let mut resolved = existing;
            if let Some(v) = delta.start_time {
                resolved.start_time = v;
            }
            if let Some(v) = delta.duration {
                resolved.duration = v;
            }
            if let Some(v) = delta.source_in {
                resolved.source_in = v;
            }
            resolved = validator::resolve_update(resolved, delta.properties.as_ref());

            if let Some(config) = state.config.clone() {
                let input = ValidationInput {
                    clip: &resolved,
                    track_kind,
                    is_new_for_user: false,
                    user_clip_count_after: 0,
                };
                let result = validator::validate(&input, &config, &state.cache);
                if !result.valid {
                    return Err(HubError::ConstraintViolation(
                        result.reason.unwrap_or_default(),
                    ));
                }
            }
        }

        for delta in &updates {
            let entry = match state.clip_ids.resolve(delta.short_id) {
                Some(e) => e.clone(),
                None => continue,
            };
            let new_track_param = delta.new_track_id.as_deref();
            let _ = state.cache.update_clip(&entry.full_id, new_track_param, |c| {
                if let Some(v) = delta.start_time {
                    c.start_time = v;
                }
                if let Some(v) = delta.duration {
                    c.duration = v;
                }
                if let Some(v) = delta.source_in {
                    c.source_in = v;
                }
                if let Some(props) = &delta.properties {
                    c.properties.merge(props);
                }
            });
            if let Some(new_track) = &delta.new_track_id {
                state.clip_ids.retarget(delta.short_id, new_track);
            }
        }
        state.edit_count += updates.len() as u64;

        Ok(vec![Outbound::all_except(
            conn_id,
            Envelope::new(Payload::ClipBatchUpdate {
                match_id: self.match_id.clone(),
                updates,
                updated_by: user_id,
            }),
        )])
    }

    pub fn handle_zone_subscribe(
        &self,
        conn_id: ConnId,
        start_time: f64,
        end_time: f64,
    ) -> Result<Outbound, HubError> {
        let mut state = self.lock();
        if !state.member_conn_ids.contains(&conn_id) {
            return Err(HubError::NotInMatch(self.match_id.clone()));
        }
        let z = Zone { start_time, end_time };
        state.zones.insert(conn_id, z);
        let tracks = zone::snapshot_for_zone(&state.cache, &z, self.limits.zone_buffer_secs);
        Ok(Outbound::to(
            conn_id,
            Envelope::new(Payload::ZoneClips {
                match_id: self.match_id.clone(),
                start_time,
                end_time,
                tracks,
            }),
        ))
    }

    fn zone_filtered_fanout(
        &self,
        state: &RoomState,
        sender: ConnId,
        clip_start: f64,
        clip_duration: f64,
        envelope: Envelope,
    ) -> Vec<Outbound> {
        state
            .member_conn_ids
            .iter()
            .filter(|&&conn| conn != sender)
            .filter(|conn| {
                let zone = state.zones.get(conn);
                match zone {
                    None => true,
                    Some(z) => z.overlaps(clip_start, clip_duration, self.limits.zone_buffer_secs),
                }
            })
            .map(|&conn| Outbound::to(conn, envelope.clone()))
            .collect()
    }

    pub fn snapshot_timeline(&self) -> crate::wire::messages::Timeline {
        self.lock().cache.to_timeline()
    }

    pub fn apply_full_sync(&self, timeline: crate::wire::messages::Timeline) {
        let mut state = self.lock();
        state.cache = TimelineCache::new(timeline.duration, timeline.tracks);
    }

    // ---- Chat & vote-kick ----

    pub fn handle_chat_message(
        &self,
        conn_id: ConnId,
        raw_message: &str,
        now: Instant,
        vote_kick_expiry: Duration,
    ) -> Result<ChatOutcome, HubError> {
        let mut state = self.lock();
        if !state.member_conn_ids.contains(&conn_id) {
            return Err(HubError::NotInMatch(self.match_id.clone()));
        }
        let identity = state
            .member_identity
            .get(&conn_id)
            .cloned()
            .ok_or_else(|| HubError::NotInMatch(self.match_id.clone()))?;

        if let Some(limiter) = state.rate_limiters.get_mut(&conn_id) {
            limiter.check_and_record(now)?;
        }

        let message = chat::normalize_message(raw_message)?;

        if let Some(query) = message.strip_prefix("!kick ") {
            let (outbound, armed_vote) =
                self.handle_kick_command(&mut state, conn_id, &identity, query.trim(), now, vote_kick_expiry);
            return Ok(ChatOutcome { outbound, armed_vote });
        }
        if message.eq_ignore_ascii_case("y") || message.eq_ignore_ascii_case("yes") {
            if let Some(outbound) = self.handle_vote(&mut state, conn_id, &identity, now, vote_kick_expiry) {
                return Ok(ChatOutcome {
                    outbound,
                    armed_vote: None,
                });
            }
        }

        let entry = ChatEntry {
            message_id: uuid::Uuid::new_v4().to_string(),
            user_id: identity.user_id.clone(),
            username: identity.username.clone(),
            user_image: identity.user_image.clone(),
            highlight_color: identity.highlight_color.clone(),
            message,
            timestamp: wall_clock_millis(),
        };
        state.chat_history.push(entry.clone());

        Ok(ChatOutcome {
            outbound: vec![Outbound::all(Envelope::new(Payload::ChatBroadcast {
                match_id: self.match_id.clone(),
                message_id: entry.message_id,
                user_id: entry.user_id,
                username: entry.username,
                user_image: entry.user_image,
                highlight_color: entry.highlight_color,
                message: entry.message,
                timestamp: entry.timestamp,
            }))],
            armed_vote: None,
        })
    }

    /// Returns the broadcast outbound plus, when a new vote-kick was just
    /// armed (as opposed to executed immediately), the `vote_id` the caller
    /// must schedule a 30 s expiry timer for (arming a 30 s expiry
    /// timer"). The room itself holds no timer handles or async runtime; the
    /// connection layer owns the actual `tokio::time::sleep`.
    fn handle_kick_command(
        &self,
        state: &mut RoomState,
        conn_id: ConnId,
        initiator: &MemberIdentity,
        query: &str,
        now: Instant,
        expiry: Duration,
    ) -> (Vec<Outbound>, Option<String>) {
        let candidates: Vec<(String, String)> = state
            .member_identity
            .values()
            .filter(|m| m.user_id != initiator.user_id)
            .map(|m| (m.user_id.clone(), m.username.clone()))
            .collect();

        let target = match chat::resolve_kick_query(query, &candidates) {
            KickQueryResult::NoMatch => {
                return (
                    vec![self.system_message_to(conn_id, format!("No player matching \"{query}\" found."))],
                    None,
                )
            }
            KickQueryResult::Ambiguous => {
                return (
                    vec![self.system_message_to(
                        conn_id,
                        format!("Multiple players match \"{query}\"; be more specific."),
                    )],
                    None,
                )
            }
            KickQueryResult::Unique(user_id) => user_id,
        };

        if let Some(active) = &state.active_vote_kick {
            if !active.is_expired(now, expiry) {
                return (
                    vec![self.system_message_to(
                        conn_id,
                        "A vote-kick is already in progress.".to_string(),
                    )],
                    None,
                );
            }
        }

        let target_username = state
            .member_identity
            .values()
            .find(|m| m.user_id == target)
            .map(|m| m.username.clone())
            .unwrap_or_else(|| target.clone());

        let unique_players = state.member_identity.len() as u32;
        let needed = chat::votes_needed(unique_players);

        if needed <= 1 {
            self.execute_kick(state, &target);
            return (
                vec![Outbound::all(Envelope::new(Payload::ChatBroadcast {
                    match_id: self.match_id.clone(),
                    message_id: uuid::Uuid::new_v4().to_string(),
                    user_id: SYSTEM_USER_ID.to_string(),
                    username: "system".to_string(),
                    user_image: None,
                    highlight_color: "#ff0000".to_string(),
                    message: format!("{target_username} was voted out."),
                    timestamp: wall_clock_millis(),
                }))],
                None,
            );
        }

        let vote_id = state.next_vote_id;
        state.next_vote_id += 1;
        let vote_id = vote_id.to_string();
        let vote = VoteKick::new(
            vote_id.clone(),
            target.clone(),
            target_username.clone(),
            initiator.user_id.clone(),
            needed,
            now,
        );
        state.active_vote_kick = Some(vote);

        (
            vec![Outbound::all(Envelope::new(Payload::ChatBroadcast {
                match_id: self.match_id.clone(),
                message_id: uuid::Uuid::new_v4().to_string(),
                user_id: SYSTEM_USER_ID.to_string(),
                username: "system".to_string(),
                user_image: None,
                highlight_color: "#ff0000".to_string(),
                message: format!(
                    "{} wants to kick {target_username}. Type 'y' to vote ({needed} needed).",
                    initiator.username
                ),
                timestamp: wall_clock_millis(),
            }))],
            Some(vote_id),
        )
    }

    fn handle_vote(
        &self,
        state: &mut RoomState,
        conn_id: ConnId,
        voter: &MemberIdentity,
        now: Instant,
        expiry: Duration,
    ) -> Option<Vec<Outbound>> {
        let expired = state
            .active_vote_kick
            .as_ref()
            .map(|v| v.is_expired(now, expiry))
            .unwrap_or(true);
        if expired {
            if state.active_vote_kick.take().is_some() {
                return Some(vec![Outbound::all(Envelope::new(Payload::ChatBroadcast {
                    match_id: self.match_id.clone(),
                    message_id: uuid::Uuid::new_v4().to_string(),
                    user_id: SYSTEM_USER_ID.to_string(),
                    username: "system".to_string(),
                    user_image: None,
                    highlight_color: "#ff0000".to_string(),
                    message: "The vote-kick expired.".to_string(),
                    timestamp: wall_clock_millis(),
                }))]);
            }
            return None;
        }

        let outcome = state
            .active_vote_kick
            .as_mut()
            .map(|v| v.add_vote(&voter.user_id));
        match outcome {
            Some(VoteOutcome::TargetCannotVote) => Some(vec![self.system_message_to(
                conn_id,
                "You cannot vote on your own kick.".to_string(),
            )]),
            Some(VoteOutcome::AlreadyVoted) => Some(vec![self.system_message_to(
                conn_id,
                "You already voted.".to_string(),
            )]),
            Some(VoteOutcome::Recorded) => None,
            Some(VoteOutcome::Executed) => {
                let target = state.active_vote_kick.take().unwrap().target_user_id;
                let target_username = state
                    .member_identity
                    .values()
                    .find(|m| m.user_id == target)
                    .map(|m| m.username.clone())
                    .unwrap_or_else(|| target.clone());
                self.execute_kick(state, &target);
                Some(vec![Outbound::all(Envelope::new(Payload::ChatBroadcast {
                    match_id: self.match_id.clone(),
                    message_id: uuid::Uuid::new_v4().to_string(),
                    user_id: SYSTEM_USER_ID.to_string(),
                    username: "system".to_string(),
                    user_image: None,
                    highlight_color: "#ff0000".to_string(),
                    message: format!("{target_username} was voted out."),
                    timestamp: wall_clock_millis(),
                }))])
            }
            None => None,
        }
    }

    /// Bans the target for the match's lifetime. Does not itself close
    /// sockets; the caller uses `banned_member_conns` afterwards to find
    /// every connection of that user and close them via the registry.
    fn execute_kick(&self, state: &mut RoomState, target_user_id: &str) {
        state.banned_users.insert(target_user_id.to_string());
        info!(match_id = %self.match_id, user_id = %target_user_id, "user vote-kicked");
    }

    /// Connections currently in the room whose user has since been banned.
    /// Called by the dispatcher right after any chat message so a
    /// just-executed kick's targets get their sockets closed immediately.
    pub fn banned_member_conns(&self) -> Vec<ConnId> {
        let state = self.lock();
        state
            .member_conn_ids
            .iter()
            .copied()
            .filter(|id| {
                state
                    .member_identity
                    .get(id)
                    .map(|m| state.banned_users.contains(&m.user_id))
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Expires the active vote if `vote_id` still matches (idempotent:
    /// a timer firing after the vote already resolved is a no-op).
    pub fn expire_vote_if_matching(&self, vote_id: &str, now: Instant, expiry: Duration) -> Option<Vec<Outbound>> {
        let mut state = self.lock();
        let still_active = state
            .active_vote_kick
            .as_ref()
            .map(|v| v.vote_id == vote_id && v.is_expired(now, expiry))
            .unwrap_or(false);
        if !still_active {
            return None;
        }
        state.active_vote_kick = None;
        Some(vec![Outbound::all(Envelope::new(Payload::ChatBroadcast {
            match_id: self.match_id.clone(),
            message_id: uuid::Uuid::new_v4().to_string(),
            user_id: SYSTEM_USER_ID.to_string(),
            username: "system".to_string(),
            user_image: None,
            highlight_color: "#ff0000".to_string(),
            message: "The vote-kick expired.".to_string(),
            timestamp: wall_clock_millis(),
        }))])
    }

    fn system_message_to(&self, conn_id: ConnId, message: String) -> Outbound {
        Outbound::to(
            conn_id,
            Envelope::new(Payload::ChatBroadcast {
                match_id: self.match_id.clone(),
                message_id: uuid::Uuid::new_v4().to_string(),
                user_id: SYSTEM_USER_ID.to_string(),
                username: "system".to_string(),
                user_image: None,
                highlight_color: "#ff0000".to_string(),
                message,
                timestamp: wall_clock_millis(),
            }),
        )
    }

    pub fn connections_of_user(&self, user_id: &str) -> Vec<ConnId> {
        self.lock()
            .member_identity
            .iter()
            .filter(|(_, identity)| identity.user_id == user_id)
            .map(|(conn, _)| *conn)
            .collect()
    }

    pub fn status_broadcast(
        &self,
        status: MatchStatusKind,
        time_remaining: Option<f64>,
    ) -> Outbound {
        let player_count = self.member_count();
        Outbound::all(Envelope::new(Payload::MatchStatus {
            match_id: self.match_id.clone(),
            status,
            time_remaining,
            player_count,
        }))
    }
}

fn kind_compatible(clip_kind: ClipKind, track_kind: TrackKind) -> bool {
    match track_kind {
        TrackKind::Video => matches!(clip_kind, ClipKind::Video | ClipKind::Image),
        TrackKind::Audio => matches!(clip_kind, ClipKind::Audio),
    }
}

fn cache_error(err: CacheError) -> HubError {
    match err {
        CacheError::TrackNotFound(t) => HubError::TrackNotFound(t),
        CacheError::ClipNotFound(c) => HubError::ClipNotFound(c, String::new()),
    }
}

fn wall_clock_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::messages::{ClipProperties, TrackSnapshot};

    fn room() -> MatchRoom {
        MatchRoom::new(
            "m1".to_string(),
            60.0,
            vec![TrackSnapshot {
                track_id: "video-0".into(),
                kind: TrackKind::Video,
                clips: vec![],
            }],
        )
    }

    fn clip(id: &str, start: f64, dur: f64) -> Clip {
        Clip {
            id: id.to_string(),
            kind: ClipKind::Video,
            start_time: start,
            duration: dur,
            source_in: 0.0,
            source_duration: dur,
            src: "s3://x".into(),
            name: "x".into(),
            thumbnail: None,
            properties: ClipProperties::default(),
        }
    }

    #[test]
    fn join_then_add_clip_increments_player_count() {
        let r = room();
        r.join(1, "u1".into(), "Alice".into(), None, None).unwrap();
        r.handle_clip_added(1, "video-0".into(), clip("c1", 1.0, 2.0)).unwrap();
        assert_eq!(r.lock().player_clip_count.get("u1"), Some(&1));
    }

    #[test]
    fn banned_user_cannot_rejoin() {
        let r = room();
        r.join(1, "u1".into(), "Alice".into(), None, None).unwrap();
        r.lock().banned_users.insert("u1".to_string());
        let err = r.join(2, "u1".into(), "Alice".into(), None, None).unwrap_err();
        assert!(matches!(err, HubError::VoteKicked(_)));
    }

    #[test]
    fn remove_after_add_nets_zero_player_clip_count() {
        let r = room();
        r.join(1, "u1".into(), "Alice".into(), None, None).unwrap();
        r.handle_clip_added(1, "video-0".into(), clip("c1", 1.0, 2.0)).unwrap();
        r.handle_clip_removed(1, "video-0".into(), "c1".into()).unwrap();
        assert_eq!(r.lock().player_clip_count.get("u1"), Some(&0));
        assert_eq!(r.lock().cache.clip_count(), 0);
    }

    #[test]
    fn repeated_clip_updates_from_one_connection_merge_into_a_single_batch_entry() {
        let r = room();
        r.join(1, "u1".into(), "Alice".into(), None, None).unwrap();
        r.handle_clip_added(1, "video-0".into(), clip("c1", 1.0, 2.0)).unwrap();

        for start in [1.01, 1.02, 1.05] {
            r.handle_clip_updated(
                1,
                "video-0".into(),
                "c1".into(),
                ClipDelta {
                    short_id: 0,
                    start_time: Some(start),
                    duration: None,
                    source_in: None,
                    properties: None,
                    new_track_id: None,
                },
            )
            .unwrap();
        }

        let drained = r.drain_batch(1).expect("batch should be pending");
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].start_time, Some(1.05));

        let (_, cached) = r.lock().cache.find_clip("c1").map(|(t, c)| (t.to_string(), c.clone())).unwrap();
        assert_eq!(cached.start_time, 1.05);
    }

    #[test]
    fn kick_with_four_players_arms_a_vote_instead_of_executing_immediately() {
        let r = room();
        r.join(1, "u1".into(), "Alice".into(), None, None).unwrap();
        r.join(2, "u2".into(), "Bob".into(), None, None).unwrap();
        r.join(3, "u3".into(), "Carol".into(), None, None).unwrap();
        r.join(4, "u4".into(), "Dave".into(), None, None).unwrap();

        let now = Instant::now();
        let expiry = Duration::from_secs(30);
        let outcome = r.handle_chat_message(1, "!kick bob", now, expiry).unwrap();
        let vote_id = outcome.armed_vote.expect("needed > 1 should arm a vote");
        assert!(!outcome.outbound.is_empty());
        assert!(!r.is_banned("u2"));

        // A timer firing before expiry for this vote_id is a no-op.
        assert!(r
            .expire_vote_if_matching(&vote_id, now + Duration::from_secs(1), expiry)
            .is_none());

        // A timer referencing a stale/mismatched vote_id is a no-op even
        // after expiry.
        assert!(r
            .expire_vote_if_matching("not-the-vote", now + Duration::from_secs(31), expiry)
            .is_none());

        // The real timer, firing after expiry with insufficient votes,
        // clears the vote and broadcasts the expiry notice exactly once.
        let expired = r
            .expire_vote_if_matching(&vote_id, now + Duration::from_secs(31), expiry)
            .expect("expired vote should broadcast a system notice");
        assert_eq!(expired.len(), 1);
        assert!(r
            .expire_vote_if_matching(&vote_id, now + Duration::from_secs(32), expiry)
            .is_none());
    }

    #[test]
    fn kick_with_two_players_executes_immediately_without_arming_a_vote() {
        let r = room();
        r.join(1, "u1".into(), "Alice".into(), None, None).unwrap();
        r.join(2, "u2".into(), "Bob".into(), None, None).unwrap();

        let now = Instant::now();
        let outcome = r
            .handle_chat_message(1, "!kick bob", now, Duration::from_secs(30))
            .unwrap();
        assert!(outcome.armed_vote.is_none());
        assert!(r.is_banned("u2"));
    }
}
