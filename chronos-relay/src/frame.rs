//! Relay wire frames.
//!
//! Frames are bincode-encoded and internal to the relay link — the payload
//! bytes they carry are the shared JSON room records from `chronos-core`,
//! passed through untouched.

use serde::{Deserialize, Serialize};

/// One frame on a relay connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RelayFrame {
    /// Client → relay: start receiving topics matching the pattern.
    Subscribe { pattern: String },
    /// Client → relay: drop one earlier subscription of this pattern.
    Unsubscribe { pattern: String },
    /// Client → relay: fan a payload out to matching subscribers.
    Publish { topic: String, payload: Vec<u8> },
    /// Relay → client: a published message matching a subscription.
    Deliver { topic: String, payload: Vec<u8> },
}

impl RelayFrame {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| FrameError::Encode(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| FrameError::Decode(e.to_string()))?;
        Ok(frame)
    }
}

/// Frame codec errors.
#[derive(Debug, Clone)]
pub enum FrameError {
    Encode(String),
    Decode(String),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encode(e) => write!(f, "Frame encode error: {e}"),
            Self::Decode(e) => write!(f, "Frame decode error: {e}"),
        }
    }
}

impl std::error::Error for FrameError {}
