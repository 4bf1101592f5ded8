//! Internal error type and the wire-visible error codes clients can match on.

use thiserror::Error;

use crate::wire::envelope::EnvelopeError;

/// Stable, client-facing error identifiers. Changing
/// a variant's wire string is a breaking change for clients; add new
/// variants instead of renaming old ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NotInMatch,
    NotAuthenticated,
    TrackTypeMismatch,
    ConstraintViolation,
    InvalidMessage,
    InvalidPayload,
    RateLimited,
    VoteKicked,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::NotInMatch => "NOT_IN_MATCH",
            ErrorCode::NotAuthenticated => "NOT_AUTHENTICATED",
            ErrorCode::TrackTypeMismatch => "TRACK_TYPE_MISMATCH",
            ErrorCode::ConstraintViolation => "CONSTRAINT_VIOLATION",
            ErrorCode::InvalidMessage => "INVALID_MESSAGE",
            ErrorCode::InvalidPayload => "INVALID_PAYLOAD",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::VoteKicked => "VOTE_KICKED",
        }
    }
}

/// Process-internal error type. Distinct from `ErrorCode`: this carries
/// context useful in logs, `ErrorCode` is what a client is told.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("match {0} not found")]
    MatchNotFound(String),
    #[error("connection is not a member of match {0}")]
    NotInMatch(String),
    #[error("user is banned from match {0}")]
    VoteKicked(String),
    #[error("clip {0} not found on track {1}")]
    ClipNotFound(String, String),
    #[error("track {0} not found")]
    TrackNotFound(String),
    #[error("clip kind does not match track type")]
    TrackTypeMismatch,
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    #[error("rate limited")]
    RateLimited,
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] EnvelopeError),
    #[error("external app request failed: {0}")]
    ExternalApi(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl HubError {
    pub fn code(&self) -> ErrorCode {
        match self {
            HubError::MatchNotFound(_) | HubError::NotInMatch(_) => ErrorCode::NotInMatch,
            HubError::VoteKicked(_) => ErrorCode::VoteKicked,
            HubError::ClipNotFound(_, _) | HubError::TrackNotFound(_) => ErrorCode::InvalidMessage,
            HubError::TrackTypeMismatch => ErrorCode::TrackTypeMismatch,
            HubError::ConstraintViolation(_) => ErrorCode::ConstraintViolation,
            HubError::RateLimited => ErrorCode::RateLimited,
            HubError::InvalidMessage(_) => ErrorCode::InvalidMessage,
            HubError::InvalidPayload(_) => ErrorCode::InvalidPayload,
            HubError::ExternalApi(_) | HubError::Io(_) => ErrorCode::InvalidMessage,
        }
    }
}
