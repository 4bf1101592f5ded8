//! Per-match persistence debouncer.
//!
//! Every accepted mutation resets a 3 s timer; when it finally fires, the
//! hub pulls a full timeline from one connected member and PATCHes it to
//! the external app. The debounce itself is a classic "generation counter"
//! pattern: each `schedule` call bumps a per-match generation and spawns a
//! sleeper that only acts if nobody bumped the generation again before it
//! woke up — the same shape `yahoo_logic::upstream`'s reconnect backoff
//! uses for "cancel the previous attempt if a newer one started".

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tracing::warn;

use crate::http_client::log_external_error;
use crate::state::AppState;
use crate::wire::envelope::Envelope;
use crate::wire::messages::{Payload, Timeline};

/// Bound on how long the hub waits for the chosen member to answer
/// `RequestTimelineSync` with `TimelineSync` before giving up on this tick.
/// Chosen well above the 50 ms batch
/// window and client round-trip jitter without blocking a debounce cycle
/// indefinitely if that member has gone silent.
const SYNC_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct PersistenceScheduler {
    debounce: Duration,
    generations: Mutex<HashMap<String, Arc<AtomicU64>>>,
    /// One slot per match with an in-flight `RequestTimelineSync`; fulfilled
    /// by the connection task that receives the matching `TimelineSync`.
    pending_syncs: Mutex<HashMap<String, oneshot::Sender<Timeline>>>,
}

impl PersistenceScheduler {
    pub fn new(debounce: Duration) -> Self {
        PersistenceScheduler {
            debounce,
            generations: Mutex::new(HashMap::new()),
            pending_syncs: Mutex::new(HashMap::new()),
        }
    }

    async fn generation_for(&self, match_id: &str) -> Arc<AtomicU64> {
        let mut generations = self.generations.lock().await;
        generations
            .entry(match_id.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone()
    }

    /// Resets the debounce timer for `match_id`. Called after every accepted
    /// clip add/update/remove/split.
    pub async fn schedule(&self, state: Arc<AppState>, match_id: String) {
        let generation = self.generation_for(&match_id).await;
        let my_generation = generation.fetch_add(1, Ordering::SeqCst) + 1;
        let debounce = self.debounce;
        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            if generation.load(Ordering::SeqCst) != my_generation {
                return; // superseded by a later mutation; that timer will fire instead
            }
            fire(&state, &match_id).await;
        });
    }

    /// Invalidates any in-flight timer for a match, e.g. on room teardown.
    pub async fn cancel(&self, match_id: &str) {
        if let Some(generation) = self.generations.lock().await.get(match_id) {
            generation.fetch_add(1, Ordering::SeqCst);
        }
        self.pending_syncs.lock().await.remove(match_id);
    }

    /// Fulfills a pending `RequestTimelineSync` with the `TimelineSync` a
    /// client just sent back. Called from the dispatcher; a miss (no
    /// pending request, or an already-timed-out one) is silently ignored.
    pub async fn resolve(&self, match_id: &str, timeline: Timeline) {
        if let Some(tx) = self.pending_syncs.lock().await.remove(match_id) {
            let _ = tx.send(timeline);
        }
    }
}

async fn fire(state: &Arc<AppState>, match_id: &str) {
    let Some(room) = state.room(match_id).await else {
        return;
    };
    // Spec §4.I: "If no member is connected at fire time, the timer is
    // dropped; the HTTP layer recovers the last snapshot on reconnect."
    let Some(conn_id) = room.first_member() else {
        return;
    };
    let Some(entry) = state.registry.get(conn_id) else {
        return;
    };

    let (tx, rx) = oneshot::channel();
    state
        .persistence
        .pending_syncs
        .lock()
        .await
        .insert(match_id.to_string(), tx);

    let envelope = Envelope::new(Payload::RequestTimelineSync {
        match_id: match_id.to_string(),
    });
    let bytes = match envelope.encode() {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(match_id, error = %err, "failed to encode RequestTimelineSync");
            state.persistence.pending_syncs.lock().await.remove(match_id);
            return;
        }
    };
    if !entry.send(bytes) {
        state.persistence.pending_syncs.lock().await.remove(match_id);
        return;
    }

    let timeline = match tokio::time::timeout(SYNC_REPLY_TIMEOUT, rx).await {
        Ok(Ok(timeline)) => timeline,
        Ok(Err(_)) | Err(_) => {
            state.persistence.pending_syncs.lock().await.remove(match_id);
            warn!(match_id, "timed out waiting for TimelineSync reply");
            return;
        }
    };

    room.apply_full_sync(timeline.clone());
    let edit_count = room.edit_count();
    if let Err(err) = state.http.patch_match(match_id, &timeline, edit_count).await {
        log_external_error("patch_match", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn generation_bump_is_monotonic() {
        let scheduler = PersistenceScheduler::new(Duration::from_millis(10));
        let g1 = scheduler.generation_for("m1").await;
        let before = g1.load(Ordering::SeqCst);
        let g2 = scheduler.generation_for("m1").await;
        assert!(Arc::ptr_eq(&g1, &g2));
        assert_eq!(before, g2.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn resolve_without_pending_request_is_a_no_op() {
        let scheduler = PersistenceScheduler::new(Duration::from_millis(10));
        scheduler
            .resolve(
                "m1",
                Timeline {
                    duration: 10.0,
                    tracks: vec![],
                },
            )
            .await;
    }
}
