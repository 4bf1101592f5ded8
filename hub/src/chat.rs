//! In-match chat ring buffer, per-connection rate limiting, and the
//! `!kick`/vote-kick state machine.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::HubError;

pub const MAX_MESSAGE_BYTES: usize = 200;
pub const CHAT_HISTORY_CAP: usize = 100;
/// Minimum gap between two consecutive messages from the same connection,
/// independent of the broader rate-limit window.
pub const COOLDOWN: Duration = Duration::from_secs(1);
/// Synthetic sender id for server-authored system chat lines.
pub const SYSTEM_USER_ID: &str = "system";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatEntry {
    pub message_id: String,
    pub user_id: String,
    pub username: String,
    pub user_image: Option<String>,
    pub highlight_color: String,
    pub message: String,
    pub timestamp: i64,
}

/// Fixed-capacity FIFO history; oldest entries fall off once full.
#[derive(Debug)]
pub struct ChatHistory {
    entries: VecDeque<ChatEntry>,
    cap: usize,
}

impl Default for ChatHistory {
    fn default() -> Self {
        ChatHistory::new(CHAT_HISTORY_CAP)
    }
}

impl ChatHistory {
    pub fn new(cap: usize) -> Self {
        ChatHistory {
            entries: VecDeque::new(),
            cap,
        }
    }

    pub fn push(&mut self, entry: ChatEntry) {
        if self.entries.len() >= self.cap {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn snapshot(&self) -> Vec<ChatEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Trims whitespace, truncates to the byte cap, and rejects empty messages.
/// Truncation is byte-based but snapped to a char boundary so the result is
/// always valid UTF-8.
pub fn normalize_message(raw: &str) -> Result<String, HubError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(HubError::InvalidMessage("chat message is empty".into()));
    }
    if trimmed.len() <= MAX_MESSAGE_BYTES {
        return Ok(trimmed.to_string());
    }
    let mut end = MAX_MESSAGE_BYTES;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    Ok(trimmed[..end].to_string())
}

/// Sliding-window + cooldown rate limiter, one instance per connection.
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    max_in_window: u32,
    sent: VecDeque<Instant>,
    last_sent: Option<Instant>,
}

impl RateLimiter {
    pub fn new(window: Duration, max_in_window: u32) -> Self {
        RateLimiter {
            window,
            max_in_window,
            sent: VecDeque::new(),
            last_sent: None,
        }
    }

    /// Returns `Ok(())` and records the send if it's allowed, otherwise
    /// `Err(HubError::RateLimited)` with no side effect.
    pub fn check_and_record(&mut self, now: Instant) -> Result<(), HubError> {
        if let Some(last) = self.last_sent {
            if now.duration_since(last) < COOLDOWN {
                return Err(HubError::RateLimited);
            }
        }
        while let Some(&oldest) = self.sent.front() {
            if now.duration_since(oldest) > self.window {
                self.sent.pop_front();
            } else {
                break;
            }
        }
        if self.sent.len() as u32 >= self.max_in_window {
            return Err(HubError::RateLimited);
        }
        self.sent.push_back(now);
        self.last_sent = Some(now);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KickQueryResult {
    NoMatch,
    Ambiguous,
    Unique(String),
}

/// Exact match wins outright; otherwise prefix match; otherwise substring.
/// All comparisons are case-insensitive. More than one candidate at any
/// stage is ambiguous even if a later stage would have narrowed to one.
pub fn resolve_kick_query(query: &str, candidates: &[(String, String)]) -> KickQueryResult {
    let needle = query.to_lowercase();

    let exact: Vec<&(String, String)> = candidates
        .iter()
        .filter(|(_, name)| name.to_lowercase() == needle)
        .collect();
    if exact.len() == 1 {
        return KickQueryResult::Unique(exact[0].0.clone());
    }
    if exact.len() > 1 {
        return KickQueryResult::Ambiguous;
    }

    let prefix: Vec<&(String, String)> = candidates
        .iter()
        .filter(|(_, name)| name.to_lowercase().starts_with(&needle))
        .collect();
    if prefix.len() == 1 {
        return KickQueryResult::Unique(prefix[0].0.clone());
    }
    if prefix.len() > 1 {
        return KickQueryResult::Ambiguous;
    }

    let substring: Vec<&(String, String)> = candidates
        .iter()
        .filter(|(_, name)| name.to_lowercase().contains(&needle))
        .collect();
    match substring.len() {
        0 => KickQueryResult::NoMatch,
        1 => KickQueryResult::Unique(substring[0].0.clone()),
        _ => KickQueryResult::Ambiguous,
    }
}

/// `needed = max(1, ceil((unique_players - 1) * 0.5))`, i.e. at least half
/// of everyone except the target.
pub fn votes_needed(unique_players: u32) -> u32 {
    let others = unique_players.saturating_sub(1) as f64;
    (others * 0.5).ceil().max(1.0) as u32
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteOutcome {
    Recorded,
    AlreadyVoted,
    Executed,
    TargetCannotVote,
}

#[derive(Debug, Clone)]
pub struct VoteKick {
    pub vote_id: String,
    pub target_user_id: String,
    pub target_username: String,
    pub initiator_user_id: String,
    pub votes_for: HashSet<String>,
    pub needed: u32,
    pub started_at: Instant,
}

impl VoteKick {
    pub fn new(
        vote_id: String,
        target_user_id: String,
        target_username: String,
        initiator_user_id: String,
        needed: u32,
        now: Instant,
    ) -> Self {
        let mut votes_for = HashSet::new();
        votes_for.insert(initiator_user_id.clone());
        VoteKick {
            vote_id,
            target_user_id,
            target_username,
            initiator_user_id,
            votes_for,
            needed,
            started_at: now,
        }
    }

    pub fn add_vote(&mut self, user_id: &str) -> VoteOutcome {
        if user_id == self.target_user_id {
            return VoteOutcome::TargetCannotVote;
        }
        if self.votes_for.contains(user_id) {
            return VoteOutcome::AlreadyVoted;
        }
        self.votes_for.insert(user_id.to_string());
        if self.votes_for.len() as u32 >= self.needed {
            VoteOutcome::Executed
        } else {
            VoteOutcome::Recorded
        }
    }

    pub fn is_expired(&self, now: Instant, expiry: Duration) -> bool {
        now.duration_since(self.started_at) >= expiry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_trimmed_and_truncated() {
        let raw = "  hello  ";
        assert_eq!(normalize_message(raw).unwrap(), "hello");
        let long = "x".repeat(300);
        let normalized = normalize_message(&long).unwrap();
        assert_eq!(normalized.len(), MAX_MESSAGE_BYTES);
    }

    #[test]
    fn empty_message_rejected() {
        assert!(normalize_message("   ").is_err());
    }

    #[test]
    fn history_caps_at_100() {
        let mut history = ChatHistory::new(CHAT_HISTORY_CAP);
        for i in 0..150 {
            history.push(ChatEntry {
                message_id: i.to_string(),
                user_id: "u".into(),
                username: "u".into(),
                user_image: None,
                highlight_color: "#fff".into(),
                message: "hi".into(),
                timestamp: 0,
            });
        }
        assert_eq!(history.len(), CHAT_HISTORY_CAP);
        assert_eq!(history.snapshot().first().unwrap().message_id, "50");
    }

    #[test]
    fn sixth_message_in_window_is_rate_limited() {
        let mut limiter = RateLimiter::new(Duration::from_secs(10), 5);
        let base = Instant::now();
        for i in 0..5 {
            let t = base + Duration::from_millis(1100 * i);
            limiter.check_and_record(t).expect("within limit");
        }
        let sixth = base + Duration::from_millis(1100 * 5);
        assert!(limiter.check_and_record(sixth).is_err());
    }

    #[test]
    fn cooldown_rejects_rapid_resend() {
        let mut limiter = RateLimiter::new(Duration::from_secs(10), 5);
        let base = Instant::now();
        limiter.check_and_record(base).unwrap();
        assert!(limiter.check_and_record(base + Duration::from_millis(100)).is_err());
    }

    #[test]
    fn kick_query_prefers_exact_match() {
        let candidates = vec![
            ("u1".to_string(), "Bob".to_string()),
            ("u2".to_string(), "Bobby".to_string()),
        ];
        assert_eq!(
            resolve_kick_query("bob", &candidates),
            KickQueryResult::Unique("u1".to_string())
        );
    }

    #[test]
    fn kick_query_ambiguous_prefix() {
        let candidates = vec![
            ("u1".to_string(), "Alice1".to_string()),
            ("u2".to_string(), "Alice2".to_string()),
        ];
        assert_eq!(resolve_kick_query("ali", &candidates), KickQueryResult::Ambiguous);
    }

    #[test]
    fn kick_query_no_match() {
        let candidates = vec![("u1".to_string(), "Alice".to_string())];
        assert_eq!(resolve_kick_query("zzz", &candidates), KickQueryResult::NoMatch);
    }

    #[test]
    fn needed_votes_is_half_rounded_up_with_floor_one() {
        assert_eq!(votes_needed(3), 1); // 2 others * 0.5 = 1
        assert_eq!(votes_needed(4), 2); // 3 others * 0.5 = 1.5 -> 2
        assert_eq!(votes_needed(1), 1); // no others, floor 1
    }

    #[test]
    fn vote_executes_once_threshold_met() {
        let now = Instant::now();
        let mut vote = VoteKick::new(
            "v1".into(),
            "target".into(),
            "Bob".into(),
            "initiator".into(),
            2,
            now,
        );
        assert_eq!(vote.add_vote("voter2"), VoteOutcome::Executed);
    }

    #[test]
    fn target_cannot_vote_for_own_kick() {
        let now = Instant::now();
        let mut vote = VoteKick::new("v1".into(), "target".into(), "Bob".into(), "initiator".into(), 2, now);
        assert_eq!(vote.add_vote("target"), VoteOutcome::TargetCannotVote);
    }

    #[test]
    fn duplicate_vote_is_not_double_counted() {
        let now = Instant::now();
        let mut vote = VoteKick::new("v1".into(), "target".into(), "Bob".into(), "initiator".into(), 5, now);
        assert_eq!(vote.add_vote("initiator"), VoteOutcome::AlreadyVoted);
    }

    #[test]
    fn expiry_is_monotonic_and_idempotent_by_vote_id() {
        let now = Instant::now();
        let vote = VoteKick::new("v1".into(), "target".into(), "Bob".into(), "initiator".into(), 5, now);
        assert!(!vote.is_expired(now + Duration::from_secs(10), Duration::from_secs(30)));
        assert!(vote.is_expired(now + Duration::from_secs(31), Duration::from_secs(30)));
    }
}
