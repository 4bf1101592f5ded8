//! Per-connection delta batcher.
//!
//! This module holds only the pure merge/drain logic. The 50 ms timer
//! itself lives in `connection.rs`, which owns a `DeltaBatcher` behind the
//! connection's write-task state and drives it with `tokio::time::sleep`,
//! the same timer-reset-on-activity shape `yahoo_logic::upstream`'s
//! reconnect backoff uses. Keeping the merge logic separate from the timer
//! means it can be unit-tested without a runtime.

use std::collections::HashMap;

use crate::wire::messages::{ClipDelta, ClipProperties};

#[derive(Debug, Clone)]
struct PendingEntry {
    short_id: u32,
    start_time: Option<f64>,
    duration: Option<f64>,
    source_in: Option<f64>,
    properties: Option<ClipProperties>,
    new_track_id: Option<String>,
}

/// Buffers one connection's outgoing `ClipUpdated` events, merged
/// last-write-wins per field, keyed by full clip id so repeated updates to
/// the same clip collapse into one delta.
#[derive(Debug, Default)]
pub struct DeltaBatcher {
    pending: HashMap<String, PendingEntry>,
}

impl DeltaBatcher {
    pub fn new() -> Self {
        DeltaBatcher {
            pending: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Folds one update into the pending entry for `clip_id`, creating it if
    /// this is the first update seen for that clip since the last drain.
    pub fn merge(&mut self, clip_id: &str, short_id: u32, delta: &ClipDelta) {
        let entry = self
            .pending
            .entry(clip_id.to_string())
            .or_insert_with(|| PendingEntry {
                short_id,
                start_time: None,
                duration: None,
                source_in: None,
                properties: None,
                new_track_id: None,
            });

        if delta.start_time.is_some() {
            entry.start_time = delta.start_time;
        }
        if delta.duration.is_some() {
            entry.duration = delta.duration;
        }
        if delta.source_in.is_some() {
            entry.source_in = delta.source_in;
        }
        if let Some(props) = &delta.properties {
            match &mut entry.properties {
                Some(existing) => existing.merge(props),
                None => entry.properties = Some(props.clone()),
            }
        }
        if delta.new_track_id.is_some() {
            entry.new_track_id = delta.new_track_id.clone();
        }
    }

    /// Drains all pending entries into `ClipBatchUpdate` deltas, resetting
    /// the batcher to empty. Called when the 50 ms window fires.
    pub fn drain(&mut self) -> Vec<ClipDelta> {
        self.pending
            .drain()
            .map(|(_, entry)| ClipDelta {
                short_id: entry.short_id,
                start_time: entry.start_time,
                duration: entry.duration,
                source_in: entry.source_in,
                properties: entry.properties,
                new_track_id: entry.new_track_id,
            })
            .collect()
    }

    /// Discards all buffered state without emitting anything — used when
    /// the connection drops or the match closes. Safe because the cache was
    /// already mutated when each update was first received.
    pub fn discard(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(start: Option<f64>) -> ClipDelta {
        ClipDelta {
            short_id: 1,
            start_time: start,
            duration: None,
            source_in: None,
            properties: None,
            new_track_id: None,
        }
    }

    #[test]
    fn repeated_updates_collapse_to_one_delta_with_final_value() {
        let mut batcher = DeltaBatcher::new();
        batcher.merge("c1", 1, &delta(Some(1.01)));
        batcher.merge("c1", 1, &delta(Some(1.02)));
        batcher.merge("c1", 1, &delta(Some(1.05)));
        let drained = batcher.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].start_time, Some(1.05));
    }

    #[test]
    fn distinct_clips_produce_distinct_deltas() {
        let mut batcher = DeltaBatcher::new();
        batcher.merge("c1", 1, &delta(Some(1.0)));
        batcher.merge("c2", 2, &delta(Some(2.0)));
        let drained = batcher.drain();
        assert_eq!(drained.len(), 2);
    }

    #[test]
    fn drain_resets_batcher() {
        let mut batcher = DeltaBatcher::new();
        batcher.merge("c1", 1, &delta(Some(1.0)));
        batcher.drain();
        assert!(batcher.is_empty());
    }

    #[test]
    fn discard_drops_buffered_updates() {
        let mut batcher = DeltaBatcher::new();
        batcher.merge("c1", 1, &delta(Some(1.0)));
        batcher.discard();
        assert!(batcher.is_empty());
    }
}
