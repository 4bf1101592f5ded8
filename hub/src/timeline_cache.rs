//! In-memory authoritative timeline per match.
//!
//! Tracks are a flat `Vec`, clips within a track are a flat `Vec`; every
//! operation scans linearly. Fine for the clip counts a single match
//! realistically holds. If that ever changes, keeping each track's clips
//! sorted by `start_time` turns the scans below into binary searches.

use crate::wire::messages::{Clip, TrackKind, TrackSnapshot};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("track {0} not found")]
    TrackNotFound(String),
    #[error("clip {0} not found")]
    ClipNotFound(String),
}

#[derive(Debug, Clone)]
pub struct TimelineCache {
    pub duration: f64,
    pub tracks: Vec<TrackSnapshot>,
}

impl TimelineCache {
    pub fn new(duration: f64, tracks: Vec<TrackSnapshot>) -> Self {
        TimelineCache { duration, tracks }
    }

    pub fn track(&self, track_id: &str) -> Option<&TrackSnapshot> {
        self.tracks.iter().find(|t| t.track_id == track_id)
    }

    pub fn track_mut(&mut self, track_id: &str) -> Option<&mut TrackSnapshot> {
        self.tracks.iter_mut().find(|t| t.track_id == track_id)
    }

    pub fn track_kind(&self, track_id: &str) -> Option<TrackKind> {
        self.track(track_id).map(|t| t.kind)
    }

    fn find_clip_track(&self, clip_id: &str) -> Option<usize> {
        self.tracks
            .iter()
            .position(|t| t.clips.iter().any(|c| c.id == clip_id))
    }

    pub fn find_clip(&self, clip_id: &str) -> Option<(&str, &Clip)> {
        for track in &self.tracks {
            if let Some(clip) = track.clips.iter().find(|c| c.id == clip_id) {
                return Some((&track.track_id, clip));
            }
        }
        None
    }

    /// Idempotent on duplicate id: re-adding a clip already present on its
    /// target track is a no-op rather than a duplicate insert.
    pub fn add_clip(&mut self, track_id: &str, clip: Clip) -> Result<(), CacheError> {
        let track = self
            .track_mut(track_id)
            .ok_or_else(|| CacheError::TrackNotFound(track_id.to_string()))?;
        if track.clips.iter().any(|c| c.id == clip.id) {
            return Ok(());
        }
        track.clips.push(clip);
        Ok(())
    }

    /// Applies a partial update, possibly moving the clip to a different
    /// track if `new_track_id` differs from the clip's current track.
    /// `patch` is called with the clip so callers can apply a delta.
    pub fn update_clip(
        &mut self,
        clip_id: &str,
        new_track_id: Option<&str>,
        patch: impl FnOnce(&mut Clip),
    ) -> Result<(), CacheError> {
        let current_idx = self
            .find_clip_track(clip_id)
            .ok_or_else(|| CacheError::ClipNotFound(clip_id.to_string()))?;

        let target_idx = match new_track_id {
            Some(target) if target != self.tracks[current_idx].track_id => {
                let idx = self
                    .tracks
                    .iter()
                    .position(|t| t.track_id == target)
                    .ok_or_else(|| CacheError::TrackNotFound(target.to_string()))?;
                Some(idx)
            }
            _ => None,
        };

        let pos = self.tracks[current_idx]
            .clips
            .iter()
            .position(|c| c.id == clip_id)
            .expect("clip located by find_clip_track must exist on that track");
        let mut clip = self.tracks[current_idx].clips.remove(pos);
        patch(&mut clip);

        let dest_idx = target_idx.unwrap_or(current_idx);
        self.tracks[dest_idx].clips.push(clip);
        Ok(())
    }

    pub fn remove_clip(&mut self, clip_id: &str) -> Result<Clip, CacheError> {
        for track in &mut self.tracks {
            if let Some(pos) = track.clips.iter().position(|c| c.id == clip_id) {
                return Ok(track.clips.remove(pos));
            }
        }
        Err(CacheError::ClipNotFound(clip_id.to_string()))
    }

    /// Replaces the original clip in place (shortened) and appends the new
    /// second half on the same track, under a single atomic mutation.
    pub fn split(
        &mut self,
        track_id: &str,
        shortened_original: Clip,
        new_clip: Clip,
    ) -> Result<(), CacheError> {
        let track = self
            .track_mut(track_id)
            .ok_or_else(|| CacheError::TrackNotFound(track_id.to_string()))?;
        let pos = track
            .clips
            .iter()
            .position(|c| c.id == shortened_original.id)
            .ok_or_else(|| CacheError::ClipNotFound(shortened_original.id.clone()))?;
        track.clips[pos] = shortened_original;
        track.clips.push(new_clip);
        Ok(())
    }

    pub fn clip_count(&self) -> usize {
        self.tracks.iter().map(|t| t.clips.len()).sum()
    }

    pub fn to_timeline(&self) -> crate::wire::messages::Timeline {
        crate::wire::messages::Timeline {
            duration: self.duration,
            tracks: self.tracks.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::messages::{ClipKind, ClipProperties};

    fn track(id: &str, kind: TrackKind) -> TrackSnapshot {
        TrackSnapshot {
            track_id: id.to_string(),
            kind,
            clips: Vec::new(),
        }
    }

    fn clip(id: &str, start: f64, dur: f64) -> Clip {
        Clip {
            id: id.to_string(),
            kind: ClipKind::Video,
            start_time: start,
            duration: dur,
            source_in: 0.0,
            source_duration: dur,
            src: "s3://x".to_string(),
            name: "x".to_string(),
            thumbnail: None,
            properties: ClipProperties::default(),
        }
    }

    fn cache() -> TimelineCache {
        TimelineCache::new(
            60.0,
            vec![track("video-0", TrackKind::Video), track("video-1", TrackKind::Video)],
        )
    }

    #[test]
    fn add_clip_is_idempotent() {
        let mut c = cache();
        c.add_clip("video-0", clip("c1", 0.0, 2.0)).unwrap();
        c.add_clip("video-0", clip("c1", 0.0, 2.0)).unwrap();
        assert_eq!(c.clip_count(), 1);
    }

    #[test]
    fn update_moves_clip_across_tracks() {
        let mut c = cache();
        c.add_clip("video-0", clip("c1", 0.0, 2.0)).unwrap();
        c.update_clip("c1", Some("video-1"), |clip| clip.start_time = 5.0)
            .unwrap();
        assert!(c.track("video-0").unwrap().clips.is_empty());
        let (track_id, found) = c.find_clip("c1").unwrap();
        assert_eq!(track_id, "video-1");
        assert_eq!(found.start_time, 5.0);
    }

    #[test]
    fn remove_clip_searches_all_tracks() {
        let mut c = cache();
        c.add_clip("video-1", clip("c2", 1.0, 1.0)).unwrap();
        let removed = c.remove_clip("c2").unwrap();
        assert_eq!(removed.id, "c2");
        assert_eq!(c.clip_count(), 0);
    }

    #[test]
    fn split_replaces_original_and_appends_new() {
        let mut c = cache();
        c.add_clip("video-0", clip("c1", 0.0, 4.0)).unwrap();
        let shortened = clip("c1", 0.0, 2.0);
        let new_half = clip("c1-b", 2.0, 2.0);
        c.split("video-0", shortened, new_half).unwrap();
        assert_eq!(c.clip_count(), 2);
        assert_eq!(c.find_clip("c1").unwrap().1.duration, 2.0);
        assert_eq!(c.find_clip("c1-b").unwrap().1.start_time, 2.0);
    }
}
