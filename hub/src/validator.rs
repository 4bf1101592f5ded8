//! Pure constraint validator. Takes a snapshot of match config,
//! timeline, and the proposed change; never touches shared state itself.

use serde::{Deserialize, Serialize};

use crate::timeline_cache::TimelineCache;
use crate::wire::messages::{Clip, ClipKind, ClipProperties, TrackKind};

/// Per-match configuration fetched (and cached) from the external app.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchConfig {
    pub clip_size_min: f64,
    pub clip_size_max: f64,
    pub audio_max_db: f64,
    pub max_video_tracks: u32,
    pub max_audio_tracks: u32,
    /// 0 means uncapped.
    pub max_clips_per_user: u32,
    /// `type:param1:param2` rule strings, e.g. `fixedClipDuration:3` or
    /// `allowedTypes:video,audio`. Authored by the external app without a
    /// coordinated hub deploy; unknown types are soft-failed (logged, skipped).
    pub constraints: Vec<String>,
}

/// Tolerance used for `fixedClipDuration` equality checks (±10 ms).
const FIXED_DURATION_TOLERANCE_SECS: f64 = 0.01;

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationResult {
    pub valid: bool,
    pub reason: Option<String>,
}

impl ValidationResult {
    pub fn ok() -> Self {
        ValidationResult {
            valid: true,
            reason: None,
        }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        ValidationResult {
            valid: false,
            reason: Some(reason.into()),
        }
    }
}

/// What's being validated: either a brand new clip (add/split) or a
/// resolved-forward view of an existing clip after applying an update delta.
pub struct ValidationInput<'a> {
    pub clip: &'a Clip,
    pub track_kind: TrackKind,
    pub is_new_for_user: bool,
    pub user_clip_count_after: u32,
}

/// Counts tracks of each kind already present in the timeline. Enforced at
/// match creation; re-checked here defensively in case config drifts.
fn track_counts(cache: &TimelineCache) -> (u32, u32) {
    let mut video = 0u32;
    let mut audio = 0u32;
    for t in &cache.tracks {
        match t.kind {
            TrackKind::Video => video += 1,
            TrackKind::Audio => audio += 1,
        }
    }
    (video, audio)
}

pub fn validate(
    input: &ValidationInput,
    config: &MatchConfig,
    cache: &TimelineCache,
) -> ValidationResult {
    let clip = input.clip;

    if clip.duration < config.clip_size_min {
        return ValidationResult::reject(format!(
            "duration {:.3}s is shorter than minimum {:.3}s",
            clip.duration, config.clip_size_min
        ));
    }
    if clip.duration > config.clip_size_max {
        return ValidationResult::reject(format!(
            "duration {:.3}s exceeds maximum {:.3}s",
            clip.duration, config.clip_size_max
        ));
    }

    if clip.start_time < 0.0 {
        return ValidationResult::reject("startTime must be non-negative");
    }
    if clip.start_time + clip.duration > cache.duration {
        return ValidationResult::reject(format!(
            "clip extends to {:.3}s, past timeline duration {:.3}s",
            clip.start_time + clip.duration,
            cache.duration
        ));
    }

    if clip.kind == ClipKind::Audio {
        if let Some(volume) = clip.properties.volume {
            if volume > 0.0 {
                let db = 20.0 * volume.log10();
                if db > config.audio_max_db {
                    return ValidationResult::reject(format!(
                        "audio level {:.1} dB exceeds maximum {:.1} dB",
                        db, config.audio_max_db
                    ));
                }
            }
        }
    }

    let (video_tracks, audio_tracks) = track_counts(cache);
    match input.track_kind {
        TrackKind::Video if video_tracks > config.max_video_tracks => {
            return ValidationResult::reject("video track count exceeds match limit");
        }
        TrackKind::Audio if audio_tracks > config.max_audio_tracks => {
            return ValidationResult::reject("audio track count exceeds match limit");
        }
        _ => {}
    }

    if input.is_new_for_user
        && config.max_clips_per_user > 0
        && input.user_clip_count_after > config.max_clips_per_user
    {
        return ValidationResult::reject(format!(
            "user has reached the per-match clip cap of {}",
            config.max_clips_per_user
        ));
    }

    for rule in &config.constraints {
        if let Some(result) = apply_custom_constraint(rule, clip) {
            if !result.valid {
                return result;
            }
        }
    }

    ValidationResult::ok()
}

/// Returns `None` for unrecognized rule types, which the caller treats as a
/// soft pass (logged and skipped).
fn apply_custom_constraint(rule: &str, clip: &Clip) -> Option<ValidationResult> {
    let mut parts = rule.split(':');
    let rule_type = parts.next()?;
    match rule_type {
        "fixedClipDuration" => {
            let seconds: f64 = parts.next()?.parse().ok()?;
            if (clip.duration - seconds).abs() > FIXED_DURATION_TOLERANCE_SECS {
                Some(ValidationResult::reject(format!(
                    "clip duration must be fixed at {seconds}s"
                )))
            } else {
                Some(ValidationResult::ok())
            }
        }
        "allowedTypes" => {
            let allowed: Vec<&str> = parts.next()?.split(',').collect();
            let kind_str = match clip.kind {
                ClipKind::Video => "video",
                ClipKind::Image => "image",
                ClipKind::Audio => "audio",
            };
            if allowed.contains(&kind_str) {
                Some(ValidationResult::ok())
            } else {
                Some(ValidationResult::reject(format!(
                    "clip kind {kind_str} is not an allowed type for this match"
                )))
            }
        }
        _ => None,
    }
}

/// Validates a proposed split: both the shortened original and the new
/// second half must independently pass the same checks `validate` runs.
pub fn validate_split(
    original: &ValidationInput,
    new_half: &ValidationInput,
    config: &MatchConfig,
    cache: &TimelineCache,
) -> ValidationResult {
    if original.clip.duration <= 0.0 || new_half.clip.duration <= 0.0 {
        return ValidationResult::reject("both halves of a split must have positive duration");
    }
    let first = validate(original, config, cache);
    if !first.valid {
        return first;
    }
    validate(new_half, config, cache)
}

/// Applies an update-style property merge without mutating the cache,
/// producing the resolved clip the validator should check.
pub fn resolve_update(mut clip: Clip, delta_properties: Option<&ClipProperties>) -> Clip {
    if let Some(delta) = delta_properties {
        clip.properties.merge(delta);
    }
    clip
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::messages::TrackSnapshot;

    fn config() -> MatchConfig {
        MatchConfig {
            clip_size_min: 0.5,
            clip_size_max: 30.0,
            audio_max_db: 0.0,
            max_video_tracks: 4,
            max_audio_tracks: 4,
            max_clips_per_user: 0,
            constraints: vec![],
        }
    }

    fn cache() -> TimelineCache {
        TimelineCache::new(
            60.0,
            vec![TrackSnapshot {
                track_id: "video-0".into(),
                kind: TrackKind::Video,
                clips: vec![],
            }],
        )
    }

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
    fn accepts_at_exact_min_duration() {
        let cfg = config();
        let c = cache();
        let clip = clip(0.0, 0.5);
        let input = ValidationInput {
            clip: &clip,
            track_kind: TrackKind::Video,
            is_new_for_user: false,
            user_clip_count_after: 0,
        };
        assert!(validate(&input, &cfg, &c).valid);
    }

    #[test]
    fn rejects_just_under_min_duration() {
        let cfg = config();
        let c = cache();
        let clip = clip(0.0, 0.499);
        let input = ValidationInput {
            clip: &clip,
            track_kind: TrackKind::Video,
            is_new_for_user: false,
            user_clip_count_after: 0,
        };
        let result = validate(&input, &cfg, &c);
        assert!(!result.valid);
    }

    #[test]
    fn accepts_at_exact_timeline_boundary() {
        let cfg = config();
        let c = cache();
        let clip = clip(59.0, 1.0);
        let input = ValidationInput {
            clip: &clip,
            track_kind: TrackKind::Video,
            is_new_for_user: false,
            user_clip_count_after: 0,
        };
        assert!(validate(&input, &cfg, &c).valid);
    }

    #[test]
    fn rejects_just_past_timeline_boundary() {
        let cfg = config();
        let c = cache();
        let clip = clip(59.0, 1.001);
        let input = ValidationInput {
            clip: &clip,
            track_kind: TrackKind::Video,
            is_new_for_user: false,
            user_clip_count_after: 0,
        };
        assert!(!validate(&input, &cfg, &c).valid);
    }

    #[test]
    fn fixed_clip_duration_constraint_allows_tolerance() {
        let mut cfg = config();
        cfg.constraints.push("fixedClipDuration:3".to_string());
        let c = cache();
        let clip = clip(0.0, 3.005);
        let input = ValidationInput {
            clip: &clip,
            track_kind: TrackKind::Video,
            is_new_for_user: false,
            user_clip_count_after: 0,
        };
        assert!(validate(&input, &cfg, &c).valid);
    }

    #[test]
    fn unknown_constraint_type_is_soft_passed() {
        let mut cfg = config();
        cfg.constraints.push("somethingFuture:1:2".to_string());
        let c = cache();
        let clip = clip(0.0, 2.0);
        let input = ValidationInput {
            clip: &clip,
            track_kind: TrackKind::Video,
            is_new_for_user: false,
            user_clip_count_after: 0,
        };
        assert!(validate(&input, &cfg, &c).valid);
    }

    #[test]
    fn per_user_clip_cap_enforced_only_on_add() {
        let mut cfg = config();
        cfg.max_clips_per_user = 2;
        let c = cache();
        let clip = clip(0.0, 2.0);
        let input = ValidationInput {
            clip: &clip,
            track_kind: TrackKind::Video,
            is_new_for_user: true,
            user_clip_count_after: 3,
        };
        assert!(!validate(&input, &cfg, &c).valid);
    }
}
