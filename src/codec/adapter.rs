//! Frame codec adapter (sender side)
//!
//! Turns encoder output samples into wire packets:
//!
//! - key pictures are detected from the sample's "not syncable" attachment
//! - the first key picture of each encoding session is preceded by
//!   `PARAM_A` and `PARAM_B` packets taken from the format description
//! - the length-prefixed access unit is rewritten as an Annex B byte stream
//! - one `KEY_PICTURE` or `DELTA_PICTURE` packet is produced per sample

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use tracing::{debug, warn, Span};

use super::encoder::EncodedSample;
use super::nal::{length_prefixed_to_annex_b, prepend_orientation};
use crate::error::Result;
use crate::protocol::{Packet, PacketTag};
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// Adapter counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AdapterStats {
    pub key_pictures: u64,
    pub delta_pictures: u64,
    /// Times a PARAM_A/PARAM_B pair was emitted
    pub parameter_sets_sent: u64,
    pub parameter_set_failures: u64,
    pub malformed_samples: u64,
    /// Payload bytes of picture packets
    pub bytes_out: u64,
}

/// Converts encoder samples into framed packets
pub struct FrameCodecAdapter {
    parameter_sets_sent: bool,
    orientation: Option<u16>,
    stats: AdapterStats,
    throttler: LogThrottler,
    span: Span,
}

impl FrameCodecAdapter {
    /// Create an adapter logging under `parent`
    pub fn new(parent: &Span) -> Self {
        Self {
            parameter_sets_sent: false,
            orientation: None,
            stats: AdapterStats::default(),
            throttler: LogThrottler::with_secs(5),
            span: tracing::debug_span!(parent: parent, "frame_adapter"),
        }
    }

    /// Prefix picture payloads with a 2-byte little-endian orientation
    pub fn with_orientation(mut self, orientation: Option<u16>) -> Self {
        self.orientation = orientation;
        self
    }

    pub fn set_orientation(&mut self, orientation: Option<u16>) {
        self.orientation = orientation;
    }

    /// Start of a new encoding session: parameter sets go out again with the next key picture
    pub fn reset_session(&mut self) {
        let _enter = self.span.enter();
        debug!("Encoding session reset, parameter sets will be resent");
        self.parameter_sets_sent = false;
    }

    pub fn parameter_sets_sent(&self) -> bool {
        self.parameter_sets_sent
    }

    pub fn stats(&self) -> &AdapterStats {
        &self.stats
    }

    /// Frame one encoder sample. Returns the packets in send order.
    pub fn process(&mut self, sample: &EncodedSample) -> Vec<Packet> {
        let _enter = self.span.enter();
        let key = sample.is_key_picture();

        let mut annex_b = BytesMut::with_capacity(sample.data.len());
        if let Err(e) = length_prefixed_to_annex_b(&sample.data, &mut annex_b) {
            self.stats.malformed_samples += 1;
            warn_throttled!(
                self.throttler,
                "malformed_sample",
                "Malformed encoder sample {}: {}",
                sample.sequence,
                e
            );
        }

        // parameter sets only travel together with the picture they precede
        if annex_b.is_empty() {
            debug!("Sample {} has no NAL units, nothing to send", sample.sequence);
            return Vec::new();
        }

        let mut packets = Vec::with_capacity(3);
        if key && !self.parameter_sets_sent {
            match extract_parameter_sets(sample) {
                Ok((sps, pps)) => {
                    debug!(
                        "Sending parameter sets (SPS {} bytes, PPS {} bytes) before frame {}",
                        sps.len(),
                        pps.len(),
                        sample.sequence
                    );
                    packets.push(Packet::frame(PacketTag::ParamA, sps));
                    packets.push(Packet::frame(PacketTag::ParamB, pps));
                    self.parameter_sets_sent = true;
                    self.stats.parameter_sets_sent += 1;
                }
                Err(e) => {
                    // Receiver waits for a later key picture that carries them
                    self.stats.parameter_set_failures += 1;
                    warn!(
                        "Key picture {} sent without parameter sets: {}",
                        sample.sequence, e
                    );
                }
            }
        }

        let payload: Bytes = match self.orientation {
            Some(orientation) => prepend_orientation(orientation, &annex_b),
            None => annex_b.freeze(),
        };
        self.stats.bytes_out += payload.len() as u64;

        let tag = if key {
            self.stats.key_pictures += 1;
            PacketTag::KeyPicture
        } else {
            self.stats.delta_pictures += 1;
            PacketTag::DeltaPicture
        };
        packets.push(Packet::frame(tag, payload));
        packets
    }
}

fn extract_parameter_sets(sample: &EncodedSample) -> Result<(Bytes, Bytes)> {
    let sps = sample.format.parameter_set(0)?;
    let pps = sample.format.parameter_set(1)?;
    Ok((sps, pps))
}
