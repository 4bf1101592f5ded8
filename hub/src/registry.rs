//! Process-global connection registry.
//!
//! Tracks every live connection by id, the set of connections per user (for
//! same-user multi-tab eviction), and the lobby-subscriber set.
//! Match membership itself is tracked per-room in `room.rs`; this registry
//! only answers "who is this connection" and "which connections does this
//! user have open anywhere".

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex as AsyncMutex};

pub type ConnId = u64;

#[derive(Debug, Clone, Default)]
pub struct ConnectionState {
    pub user_id: Option<String>,
    pub username: Option<String>,
    pub user_image: Option<String>,
    pub highlight_color: Option<String>,
    pub match_id: Option<String>,
    pub subscribed_to_lobbies: bool,
    pub last_activity: Option<Instant>,
}

/// What the connection's single select loop does with something handed to
/// it from outside: write an encoded frame, or tear itself down. Using an
/// enum rather than an empty `Vec<u8>` sentinel keeps "close this
/// connection" from ever being confused with a legitimate zero-byte frame.
#[derive(Debug)]
pub enum OutboundFrame {
    Bytes(Vec<u8>),
    Ping,
    Close,
}

/// One entry per live connection: an outbound sink the write task drains,
/// plus the connection's mutable identity/activity state.
pub struct ConnectionEntry {
    pub id: ConnId,
    pub outbound: mpsc::UnboundedSender<OutboundFrame>,
    pub state: AsyncMutex<ConnectionState>,
}

impl ConnectionEntry {
    /// Best-effort send; `false` means the connection's write side is gone
    /// (task already exited), which the caller treats as already-closed.
    pub fn send(&self, frame: Vec<u8>) -> bool {
        self.outbound.send(OutboundFrame::Bytes(frame)).is_ok()
    }

    /// Requests that the connection's task close the socket and run its
    /// normal disconnect cleanup, e.g. for idle reaping or a vote-kick.
    pub fn close(&self) -> bool {
        self.outbound.send(OutboundFrame::Close).is_ok()
    }

    /// Requests a WebSocket-level ping; a client's automatic pong reply
    /// counts as activity, letting a live-but-silent connection survive the
    /// idle reaper (periodic server-initiated pings reset idle connections).
    pub fn ping(&self) -> bool {
        self.outbound.send(OutboundFrame::Ping).is_ok()
    }
}

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: std::sync::RwLock<HashMap<ConnId, Arc<ConnectionEntry>>>,
    by_user: std::sync::RwLock<HashMap<String, HashSet<ConnId>>>,
    lobby_subscribers: std::sync::RwLock<HashSet<ConnId>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        ConnectionRegistry {
            connections: std::sync::RwLock::new(HashMap::new()),
            by_user: std::sync::RwLock::new(HashMap::new()),
            lobby_subscribers: std::sync::RwLock::new(HashSet::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn register(&self, outbound: mpsc::UnboundedSender<OutboundFrame>) -> Arc<ConnectionEntry> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(ConnectionEntry {
            id,
            outbound,
            state: AsyncMutex::new(ConnectionState {
                last_activity: Some(Instant::now()),
                ..Default::default()
            }),
        });
        self.connections
            .write()
            .expect("connection registry lock poisoned")
            .insert(id, entry.clone());
        entry
    }

    /// Removes the connection entirely: from the id table, the per-user
    /// index, and the lobby-subscriber set.
    pub async fn unregister(&self, id: ConnId) {
        let removed = self
            .connections
            .write()
            .expect("connection registry lock poisoned")
            .remove(&id);
        self.lobby_subscribers
            .write()
            .expect("lobby subscriber lock poisoned")
            .remove(&id);
        if let Some(entry) = removed {
            let user_id = entry.state.lock().await.user_id.clone();
            if let Some(user_id) = user_id {
                let mut by_user = self.by_user.write().expect("by_user lock poisoned");
                if let Some(set) = by_user.get_mut(&user_id) {
                    set.remove(&id);
                    if set.is_empty() {
                        by_user.remove(&user_id);
                    }
                }
            }
        }
    }

    pub fn get(&self, id: ConnId) -> Option<Arc<ConnectionEntry>> {
        self.connections
            .read()
            .expect("connection registry lock poisoned")
            .get(&id)
            .cloned()
    }

    /// Associates a connection with a user id, e.g. on `JoinMatch`. Must be
    /// called before `connections_for_user` will include it.
    pub fn bind_user(&self, id: ConnId, user_id: &str) {
        self.by_user
            .write()
            .expect("by_user lock poisoned")
            .entry(user_id.to_string())
            .or_default()
            .insert(id);
    }

    pub fn connections_for_user(&self, user_id: &str) -> Vec<ConnId> {
        self.by_user
            .read()
            .expect("by_user lock poisoned")
            .get(user_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn subscribe_lobbies(&self, id: ConnId) {
        self.lobby_subscribers
            .write()
            .expect("lobby subscriber lock poisoned")
            .insert(id);
    }

    pub fn unsubscribe_lobbies(&self, id: ConnId) {
        self.lobby_subscribers
            .write()
            .expect("lobby subscriber lock poisoned")
            .remove(&id);
    }

    pub fn lobby_subscriber_ids(&self) -> Vec<ConnId> {
        self.lobby_subscribers
            .read()
            .expect("lobby subscriber lock poisoned")
            .iter()
            .copied()
            .collect()
    }

    pub fn all_ids(&self) -> Vec<ConnId> {
        self.connections
            .read()
            .expect("connection registry lock poisoned")
            .keys()
            .copied()
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.connections
            .read()
            .expect("connection registry lock poisoned")
            .len()
    }

    pub fn lobby_subscriber_count(&self) -> usize {
        self.lobby_subscribers
            .read()
            .expect("lobby subscriber lock poisoned")
            .len()
    }

    /// Connections that haven't sent any frame within `idle_timeout`.
    pub async fn idle_connections(&self, idle_timeout: Duration, now: Instant) -> Vec<ConnId> {
        let ids: Vec<Arc<ConnectionEntry>> = self
            .connections
            .read()
            .expect("connection registry lock poisoned")
            .values()
            .cloned()
            .collect();
        let mut idle = Vec::new();
        for entry in ids {
            let last_activity = entry.state.lock().await.last_activity;
            if let Some(last) = last_activity {
                if now.duration_since(last) >= idle_timeout {
                    idle.push(entry.id);
                }
            }
        }
        idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registering_assigns_unique_ids() {
        let registry = ConnectionRegistry::new();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let a = registry.register(tx1);
        let b = registry.register(tx2);
        assert_ne!(a.id, b.id);
        assert_eq!(registry.connection_count(), 2);
    }

    #[tokio::test]
    async fn binding_user_enables_lookup_and_unregister_cleans_it_up() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let entry = registry.register(tx);
        entry.state.lock().await.user_id = Some("u1".to_string());
        registry.bind_user(entry.id, "u1");
        assert_eq!(registry.connections_for_user("u1"), vec![entry.id]);
        registry.unregister(entry.id).await;
        assert!(registry.connections_for_user("u1").is_empty());
    }

    #[tokio::test]
    async fn idle_connections_detected_after_timeout() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let entry = registry.register(tx);
        entry.state.lock().await.last_activity = Some(Instant::now() - Duration::from_secs(200));
        let idle = registry.idle_connections(Duration::from_secs(120), Instant::now()).await;
        assert_eq!(idle, vec![entry.id]);
    }
}
