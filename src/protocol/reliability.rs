//! Channel reliability policy

use serde::{Deserialize, Serialize};

use super::packet::{
    TAG_CAPTURE_REQUEST, TAG_COMMAND, TAG_DELTA_PICTURE, TAG_KEY_PICTURE, TAG_PARAM_A,
    TAG_PARAM_B, TAG_PHOTO,
};

/// Delivery mode offered by a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SendMode {
    /// Ordered, retransmitted
    Reliable,
    /// Unordered, no retransmission
    Unreliable,
}

impl std::fmt::Display for SendMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendMode::Reliable => write!(f, "reliable"),
            SendMode::Unreliable => write!(f, "unreliable"),
        }
    }
}

/// Pick the send mode from the first byte of an encoded packet.
///
/// A lost parameter set stalls the stream until the next key picture, so it
/// always goes reliable, as do stills and control traffic. A lost picture
/// costs one frame, which is cheaper than the latency of retransmitting it.
/// Empty buffers and unknown tags are treated as non-critical.
pub fn choose_mode(packet: &[u8]) -> SendMode {
    match packet.first() {
        Some(&TAG_PARAM_A)
        | Some(&TAG_PARAM_B)
        | Some(&TAG_PHOTO)
        | Some(&TAG_CAPTURE_REQUEST)
        | Some(&TAG_COMMAND) => SendMode::Reliable,
        Some(&TAG_KEY_PICTURE) | Some(&TAG_DELTA_PICTURE) => SendMode::Unreliable,
        Some(_) | None => SendMode::Unreliable,
    }
}
