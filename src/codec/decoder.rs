//! Decoder traits and common types

use bytes::Bytes;
use std::time::Duration;
use tokio::sync::mpsc;

use super::nal::{build_avc_decoder_record, profile_level_id};
use crate::error::Result;

/// Decoder configuration built from one SPS/PPS pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderConfig {
    pub sps: Bytes,
    pub pps: Bytes,
    /// `avcC` decoder configuration record
    pub record: Bytes,
    pub profile_level_id: String,
    /// Increments with every rebuild
    pub generation: u64,
}

impl DecoderConfig {
    pub fn build(sps: &Bytes, pps: &Bytes, generation: u64) -> Result<Self> {
        let record = build_avc_decoder_record(sps, pps)?;
        Ok(Self {
            sps: sps.clone(),
            pps: pps.clone(),
            record,
            profile_level_id: profile_level_id(sps),
            generation,
        })
    }
}

/// One access unit ready for the decoder
#[derive(Debug, Clone)]
pub struct AccessUnit {
    /// NAL units in 4-byte big-endian length-prefixed layout
    pub data: Bytes,
    /// Synthesized presentation timestamp
    pub pts: Duration,
    pub key: bool,
    pub orientation: Option<u16>,
}

/// Decoder output delivered to the rendering side
#[derive(Debug, Clone)]
pub struct DecodedPicture {
    pub pts: Duration,
    pub key: bool,
    pub orientation: Option<u16>,
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

/// Where decoder sessions deliver pictures
pub type PictureSink = mpsc::UnboundedSender<DecodedPicture>;

/// Decoder session
///
/// `decode` is fire-and-forget: pictures arrive on the session's
/// [`PictureSink`], not as a return value.
pub trait DecoderSession: Send {
    fn name(&self) -> &str;

    fn decode(&mut self, unit: AccessUnit) -> Result<()>;

    /// Emit everything still buffered
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Stop delivering output; the session is dropped right after
    fn invalidate(&mut self) {}
}

/// Decoder factory
pub trait DecoderFactory: Send + Sync {
    fn create(&self, config: &DecoderConfig, sink: PictureSink) -> Result<Box<dyn DecoderSession>>;

    fn decoder_type(&self) -> &str;
}
