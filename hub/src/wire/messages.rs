//! Typed payloads carried by the envelope (`super::envelope`).
//!
//! One variant per message kind. Kept as plain,
//! serde-derived structs/enums rather than a single giant struct with
//! optional fields, so a decode failure for one kind can't silently
//! corrupt another.

use serde::{Deserialize, Serialize};

/// Kind of media a clip carries. Must match the track it's placed on
/// (images are allowed on video tracks).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClipKind {
    Video,
    Image,
    Audio,
}

/// Track type. A track's clips must all be kind-compatible with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackKind {
    Video,
    Audio,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Zoom {
    pub x: f64,
    pub y: f64,
    pub linked: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flip {
    pub h: bool,
    pub v: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Crop {
    pub left: f64,
    pub right: f64,
    pub top: f64,
    pub bottom: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

/// Flat property bag carried on the wire for every clip, regardless of kind.
/// Visual-only and audio-only fields are simply unused for the other kind;
/// this mirrors a flat property struct on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClipProperties {
    // Visual
    pub position: Option<Position>,
    pub size: Option<Size>,
    pub zoom: Option<Zoom>,
    pub rotation: Option<f64>,
    pub flip: Option<Flip>,
    pub crop: Option<Crop>,
    pub freeze_frame: Option<bool>,
    pub freeze_frame_time: Option<f64>,
    // Audio
    pub volume: Option<f64>,
    pub pan: Option<f64>,
    pub pitch: Option<f64>,
    // Shared
    pub speed: Option<f64>,
}

impl ClipProperties {
    /// Deep-merges `other` onto `self`, field by field; `Some` values in
    /// `other` win, `None` values leave the existing field untouched.
    pub fn merge(&mut self, other: &ClipProperties) {
        macro_rules! merge_field {
            ($f:ident) => {
                if other.$f.is_some() {
                    self.$f = other.$f;
                }
            };
        }
        merge_field!(position);
        merge_field!(size);
        merge_field!(zoom);
        merge_field!(rotation);
        merge_field!(flip);
        merge_field!(crop);
        merge_field!(freeze_frame);
        merge_field!(freeze_frame_time);
        merge_field!(volume);
        merge_field!(pan);
        merge_field!(pitch);
        merge_field!(speed);
    }
}

/// A clip as carried on the wire, keyed by its client-generated string id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Clip {
    pub id: String,
    pub kind: ClipKind,
    pub start_time: f64,
    pub duration: f64,
    pub source_in: f64,
    pub source_duration: f64,
    pub src: String,
    pub name: String,
    pub thumbnail: Option<String>,
    pub properties: ClipProperties,
}

/// A single track's clips, used for zone snapshots and timeline sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackSnapshot {
    pub track_id: String,
    pub kind: TrackKind,
    pub clips: Vec<Clip>,
}

/// The full fixed-duration composition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timeline {
    pub duration: f64,
    pub tracks: Vec<TrackSnapshot>,
}

/// One delta entry inside a `ClipBatchUpdate`, addressed by short id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClipDelta {
    pub short_id: u32,
    pub start_time: Option<f64>,
    pub duration: Option<f64>,
    pub source_in: Option<f64>,
    pub properties: Option<ClipProperties>,
    pub new_track_id: Option<String>,
}

/// Server-minted mapping from a full string id to its short integer id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClipIdMappingEntry {
    pub short_id: u32,
    pub full_id: String,
    pub track_id: String,
    pub kind: ClipKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchStatusKind {
    Preparing,
    Active,
    Completing,
    Rendering,
    Completed,
    Failed,
}

/// Media metadata relayed verbatim for `MediaUploaded`/`MediaRemoved`; the hub
/// performs no validation on this payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaInfo {
    pub media_id: String,
    pub src: String,
    pub name: String,
    pub thumbnail: Option<String>,
}

/// A lobby entry, as relayed verbatim from the external app with no filtering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LobbySummary {
    pub id: String,
    pub name: String,
    pub player_count: u32,
    pub status: String,
}

/// Every payload kind the hub can send or receive, tagged so the codec can
/// dispatch on `discriminant` without decoding the body twice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    Ping,
    Pong,

    SubscribeLobbies,
    UnsubscribeLobbies,
    LobbiesUpdate {
        lobbies: Vec<LobbySummary>,
    },

    JoinMatch {
        match_id: String,
        user_id: String,
        username: String,
        user_image: Option<String>,
        highlight_color: Option<String>,
    },
    LeaveMatch {
        match_id: String,
        user_id: String,
    },

    MediaUploaded {
        match_id: String,
        media: MediaInfo,
    },
    MediaRemoved {
        match_id: String,
        media_id: String,
    },

    ClipAdded {
        match_id: String,
        track_id: String,
        clip: Clip,
        added_by: String,
    },
    ClipUpdated {
        match_id: String,
        track_id: String,
        clip_id: String,
        updates: ClipDelta,
        updated_by: String,
    },
    ClipRemoved {
        match_id: String,
        track_id: String,
        clip_id: String,
        removed_by: String,
    },
    ClipSplit {
        match_id: String,
        track_id: String,
        original_clip: Clip,
        new_clip: Clip,
        split_by: String,
    },
    ClipBatchUpdate {
        match_id: String,
        updates: Vec<ClipDelta>,
        updated_by: String,
    },
    ClipIdMapping {
        match_id: String,
        mappings: Vec<ClipIdMappingEntry>,
    },

    ZoneSubscribe {
        match_id: String,
        start_time: f64,
        end_time: f64,
    },
    ZoneClips {
        match_id: String,
        start_time: f64,
        end_time: f64,
        tracks: Vec<TrackSnapshot>,
    },

    ClipSelection {
        match_id: String,
        user_id: String,
        username: String,
        user_image: Option<String>,
        highlight_color: String,
        selected_clips: Vec<String>,
    },

    TimelineSync {
        match_id: String,
        timeline: Timeline,
    },
    RequestTimelineSync {
        match_id: String,
    },

    ChatMessage {
        match_id: String,
        message: String,
    },
    ChatBroadcast {
        match_id: String,
        message_id: String,
        user_id: String,
        username: String,
        user_image: Option<String>,
        highlight_color: String,
        message: String,
        timestamp: i64,
    },

    PlayerCount {
        match_id: String,
        count: u32,
    },
    PlayerJoined {
        match_id: String,
        user_id: String,
        username: String,
        user_image: Option<String>,
        highlight_color: Option<String>,
    },
    PlayerLeft {
        match_id: String,
        user_id: String,
    },
    MatchStatus {
        match_id: String,
        status: MatchStatusKind,
        time_remaining: Option<f64>,
        player_count: u32,
    },

    Error {
        code: String,
        message: String,
    },
}
