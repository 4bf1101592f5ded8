//! Per-match bijection between client-generated full string clip IDs and
//! server-minted 32-bit short IDs.

use std::collections::HashMap;

/// Which track a short ID currently resolves to, alongside its full id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortIdEntry {
    pub full_id: String,
    pub track_id: String,
}

/// Short IDs are never reused within a match's lifetime, even after the
/// clip they named is removed, so a stale reference in flight fails closed
/// (lookup miss) rather than silently resolving to a different clip.
#[derive(Debug, Default)]
pub struct ClipIdAllocator {
    full_to_short: HashMap<String, u32>,
    short_to_full: HashMap<u32, ShortIdEntry>,
    next_short: u32,
}

impl ClipIdAllocator {
    pub fn new() -> Self {
        ClipIdAllocator {
            full_to_short: HashMap::new(),
            short_to_full: HashMap::new(),
            next_short: 1,
        }
    }

    /// Returns the existing short id for `full_id` if already minted,
    /// otherwise allocates and registers a fresh one. Idempotent: calling
    /// this twice for the same full id returns the same short id.
    pub fn allocate(&mut self, full_id: &str, track_id: &str) -> u32 {
        if let Some(&short) = self.full_to_short.get(full_id) {
            return short;
        }
        let short = self.next_short;
        self.next_short += 1;
        self.full_to_short.insert(full_id.to_string(), short);
        self.short_to_full.insert(
            short,
            ShortIdEntry {
                full_id: full_id.to_string(),
                track_id: track_id.to_string(),
            },
        );
        short
    }

    pub fn short_for(&self, full_id: &str) -> Option<u32> {
        self.full_to_short.get(full_id).copied()
    }

    pub fn resolve(&self, short_id: u32) -> Option<&ShortIdEntry> {
        self.short_to_full.get(&short_id)
    }

    /// Updates the track a short id's entry points at, e.g. after a batch
    /// delta moves the clip to a different track. Does not mint a new id.
    pub fn retarget(&mut self, short_id: u32, new_track_id: &str) {
        if let Some(entry) = self.short_to_full.get_mut(&short_id) {
            entry.track_id = new_track_id.to_string();
        }
    }

    /// Removes the mapping for a clip whose full id was dropped from the
    /// cache. The short id itself is retired, not recycled.
    pub fn remove(&mut self, full_id: &str) {
        if let Some(short) = self.full_to_short.remove(full_id) {
            self.short_to_full.remove(&short);
        }
    }

    pub fn len(&self) -> usize {
        self.full_to_short.len()
    }

    pub fn is_empty(&self) -> bool {
        self.full_to_short.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_is_idempotent() {
        let mut ids = ClipIdAllocator::new();
        let a = ids.allocate("c1", "video-0");
        let b = ids.allocate("c1", "video-0");
        assert_eq!(a, b);
        assert_eq!(ids.len(), 1);
    }

    #[test]
    fn ten_thousand_add_remove_cycles_never_collide() {
        let mut ids = ClipIdAllocator::new();
        let mut seen = std::collections::HashSet::new();
        for i in 0..10_000 {
            let full = format!("clip-{i}");
            let short = ids.allocate(&full, "video-0");
            assert!(seen.insert(short), "short id {short} reused");
            if i % 3 == 0 {
                ids.remove(&full);
            }
        }
    }

    #[test]
    fn removed_short_id_is_not_recycled() {
        let mut ids = ClipIdAllocator::new();
        let first = ids.allocate("c1", "video-0");
        ids.remove("c1");
        let second = ids.allocate("c2", "video-0");
        assert_ne!(first, second);
        assert!(ids.resolve(first).is_none());
    }

    #[test]
    fn retarget_updates_track_without_new_id() {
        let mut ids = ClipIdAllocator::new();
        let short = ids.allocate("c1", "video-0");
        ids.retarget(short, "video-1");
        assert_eq!(ids.resolve(short).unwrap().track_id, "video-1");
        assert_eq!(ids.short_for("c1"), Some(short));
    }
}
