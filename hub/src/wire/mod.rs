//! Wire codec: envelope framing plus every message payload the hub speaks.

pub mod envelope;
pub mod messages;

pub use envelope::{Envelope, EnvelopeError, MAX_FRAME_BYTES};
pub use messages::*;
