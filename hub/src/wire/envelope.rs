//! Binary framing around [`Payload`](super::messages::Payload).
//!
//! Each WebSocket binary frame carries exactly one `Envelope`, encoded with
//! `bincode` rather than protobuf, since this schema has no `.proto` source
//! to compile against; see DESIGN.md for the full rationale.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::messages::Payload;

/// Every message crossing the wire, server- or client-originated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Unix epoch milliseconds, stamped by the sender.
    pub timestamp: i64,
    pub payload: Payload,
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("failed to decode envelope: {0}")]
    Decode(#[from] bincode::Error),
    #[error("envelope exceeds max frame size of {max} bytes (got {got})")]
    TooLarge { max: usize, got: usize },
}

/// Frames larger than this are rejected outright (1 MiB cap).
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

impl Envelope {
    pub fn new(payload: Payload) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Envelope { timestamp, payload }
    }

    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        let bytes = bincode::serialize(self)?;
        if bytes.len() > MAX_FRAME_BYTES {
            return Err(EnvelopeError::TooLarge {
                max: MAX_FRAME_BYTES,
                got: bytes.len(),
            });
        }
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        if bytes.len() > MAX_FRAME_BYTES {
            return Err(EnvelopeError::TooLarge {
                max: MAX_FRAME_BYTES,
                got: bytes.len(),
            });
        }
        let envelope = bincode::deserialize(bytes)?;
        Ok(envelope)
    }

    /// Convenience constructor for the one message every connection can
    /// send without having joined a match yet.
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Envelope::new(Payload::Error {
            code: code.to_string(),
            message: message.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_ping() {
        let env = Envelope::new(Payload::Ping);
        let bytes = env.encode().expect("encode");
        let decoded = Envelope::decode(&bytes).expect("decode");
        assert!(matches!(decoded.payload, Payload::Ping));
    }

    #[test]
    fn rejects_oversized_frame() {
        let huge = vec![0u8; MAX_FRAME_BYTES + 1];
        let err = Envelope::decode(&huge).unwrap_err();
        assert!(matches!(err, EnvelopeError::TooLarge { .. }));
    }

    #[test]
    fn rejects_garbage_bytes() {
        let err = Envelope::decode(&[0xff, 0x00, 0x01]).unwrap_err();
        assert!(matches!(err, EnvelopeError::Decode(_)));
    }
}
