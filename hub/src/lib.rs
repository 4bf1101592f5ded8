//! EditMash realtime collaboration hub.
//!
//! See `hub::router` for the HTTP/WebSocket surface and `state::AppState`
//! for how a match's live state is held.

pub mod batcher;
pub mod chat;
pub mod clip_id;
pub mod config;
pub mod connection;
pub mod error;
pub mod http_client;
pub mod hub;
pub mod lobby;
pub mod logging;
pub mod persistence;
pub mod registry;
pub mod room;
pub mod state;
pub mod timeline_cache;
pub mod validator;
pub mod wire;
pub mod zone;
