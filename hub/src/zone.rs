//! Per-connection time-zone filter for clip-event fan-out.

use crate::timeline_cache::TimelineCache;
use crate::wire::messages::{Clip, TrackSnapshot};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Zone {
    pub start_time: f64,
    pub end_time: f64,
}

impl Zone {
    /// `true` if a clip spanning `[clip_start, clip_start+clip_duration]`
    /// overlaps this zone expanded by `buffer_secs` on both sides.
    pub fn overlaps(&self, clip_start: f64, clip_duration: f64, buffer_secs: f64) -> bool {
        let zone_start = self.start_time - buffer_secs;
        let zone_end = self.end_time + buffer_secs;
        let clip_end = clip_start + clip_duration;
        clip_start < zone_end && clip_end > zone_start
    }
}

/// `None` means "no zone subscribed", which is treated as the full
/// timeline: every event passes.
pub fn clip_passes_zone(zone: Option<&Zone>, clip: &Clip, buffer_secs: f64) -> bool {
    match zone {
        None => true,
        Some(z) => z.overlaps(clip.start_time, clip.duration, buffer_secs),
    }
}

/// Builds the `ZoneClips` snapshot for a subscribe request: every track,
/// filtered down to clips overlapping the requested window.
pub fn snapshot_for_zone(cache: &TimelineCache, zone: &Zone, buffer_secs: f64) -> Vec<TrackSnapshot> {
    cache
        .tracks
        .iter()
        .map(|track| TrackSnapshot {
            track_id: track.track_id.clone(),
            kind: track.kind,
            clips: track
                .clips
                .iter()
                .filter(|c| zone.overlaps(c.start_time, c.duration, buffer_secs))
                .cloned()
                .collect(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::messages::{ClipKind, ClipProperties, TrackKind};

    fn clip(start: f64, dur: f64) -> Clip {
        Clip {
            id: "c1".into(),
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
    fn outside_buffered_zone_is_suppressed() {
        let zone = Zone {
            start_time: 10.0,
            end_time: 15.0,
        };
        let clip = clip(2.0, 1.0);
        assert!(!clip_passes_zone(Some(&zone), &clip, 2.0));
    }

    #[test]
    fn inside_buffered_zone_passes() {
        let zone = Zone {
            start_time: 10.0,
            end_time: 15.0,
        };
        let clip = clip(11.0, 1.0);
        assert!(clip_passes_zone(Some(&zone), &clip, 2.0));
    }

    #[test]
    fn no_zone_means_everything_passes() {
        let clip = clip(1000.0, 1.0);
        assert!(clip_passes_zone(None, &clip, 2.0));
    }

    #[test]
    fn repeated_subscribe_is_deterministic() {
        let zone = Zone {
            start_time: 5.0,
            end_time: 8.0,
        };
        let cache = TimelineCache::new(
            60.0,
            vec![TrackSnapshot {
                track_id: "video-0".into(),
                kind: TrackKind::Video,
                clips: vec![clip(6.0, 1.0)],
            }],
        );
        let first = snapshot_for_zone(&cache, &zone, 2.0);
        let second = snapshot_for_zone(&cache, &zone, 2.0);
        assert_eq!(first, second);
    }
}
