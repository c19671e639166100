//! Software test-pattern codec
//!
//! Produces H.264-shaped output without real compression: every picture is
//! one slice NAL carrying the frame sequence number and an xxh64 digest of
//! the raw frame. Used by the loopback demo, the CLI sender/receiver and
//! the pipeline tests, where a real hardware codec is not available.

use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};
use xxhash_rust::xxh64::xxh64;

use super::decoder::{
    AccessUnit, DecodedPicture, DecoderConfig, DecoderFactory, DecoderSession, PictureSink,
};
use super::encoder::{
    EncodedSample, EncoderConfig, EncoderFactory, EncoderSession, H264FormatDescription, RawFrame,
};
use super::nal::{
    add_emulation_prevention, iter_length_prefixed, remove_emulation_prevention, NalUnitType,
};
use crate::error::{AppError, Result};

const NAL_IDR: u8 = 0x65;
const NAL_NON_IDR: u8 = 0x41;
const PPS: [u8; 4] = [0x68, 0xCE, 0x3C, 0x80];
const DIGEST_SEED: u64 = 0;
/// sequence (8) + digest (8)
const BODY_LEN: usize = 16;
/// rbsp_stop_one_bit followed by alignment zeros
const TRAILING_BITS: u8 = 0x80;

/// Synthetic SPS: baseline profile header followed by the picture size
pub fn synthetic_sps(width: u32, height: u32) -> Bytes {
    let mut rbsp = Vec::with_capacity(8);
    rbsp.extend_from_slice(&[0x42, 0xC0, 0x1F]);
    rbsp.extend_from_slice(&(width.min(u16::MAX as u32) as u16).to_be_bytes());
    rbsp.extend_from_slice(&(height.min(u16::MAX as u32) as u16).to_be_bytes());
    rbsp.push(TRAILING_BITS);

    let mut sps = BytesMut::with_capacity(1 + rbsp.len() + 2);
    sps.put_u8(0x67);
    sps.put_slice(&add_emulation_prevention(&rbsp));
    sps.freeze()
}

/// Picture size encoded in a synthetic SPS
pub fn synthetic_dimensions(sps: &[u8]) -> Option<(u32, u32)> {
    if NalUnitType::of(sps) != Some(NalUnitType::Sps) {
        return None;
    }
    let rbsp = remove_emulation_prevention(&sps[1..]);
    if rbsp.len() < 7 {
        return None;
    }
    let width = u16::from_be_bytes([rbsp[3], rbsp[4]]) as u32;
    let height = u16::from_be_bytes([rbsp[5], rbsp[6]]) as u32;
    Some((width, height))
}

/// Frame sequence carried by a decoded passthrough picture
pub fn picture_sequence(picture: &DecodedPicture) -> Option<u64> {
    picture_body(&picture.data).map(|(sequence, _)| sequence)
}

/// Digest of the raw frame a decoded passthrough picture was encoded from
pub fn picture_digest(picture: &DecodedPicture) -> Option<u64> {
    picture_body(&picture.data).map(|(_, digest)| digest)
}

/// Digest the encoder stores for a raw frame
pub fn frame_digest(data: &[u8]) -> u64 {
    xxh64(data, DIGEST_SEED)
}

fn picture_body(body: &[u8]) -> Option<(u64, u64)> {
    if body.len() < BODY_LEN {
        return None;
    }
    let sequence = u64::from_be_bytes(body[0..8].try_into().ok()?);
    let digest = u64::from_be_bytes(body[8..16].try_into().ok()?);
    Some((sequence, digest))
}

/// Encoder factory for [`PassthroughEncoder`]
#[derive(Debug, Default)]
pub struct PassthroughEncoderFactory;

impl EncoderFactory for PassthroughEncoderFactory {
    fn create(&self, config: EncoderConfig) -> Result<Box<dyn EncoderSession>> {
        if config.width == 0 || config.height == 0 {
            return Err(AppError::Codec(format!(
                "invalid picture size {}x{}",
                config.width, config.height
            )));
        }
        Ok(Box::new(PassthroughEncoder::new(config)))
    }

    fn encoder_type(&self) -> &str {
        "passthrough"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn priority(&self) -> u32 {
        0
    }
}

/// Test-pattern encoding session
pub struct PassthroughEncoder {
    config: EncoderConfig,
    format: Arc<H264FormatDescription>,
    frames_since_key: u32,
    force_key: bool,
}

impl PassthroughEncoder {
    pub fn new(config: EncoderConfig) -> Self {
        let format = Arc::new(H264FormatDescription::new(
            synthetic_sps(config.width, config.height),
            Bytes::from_static(&PPS),
        ));
        Self {
            config,
            format,
            frames_since_key: 0,
            force_key: true,
        }
    }

    fn pts(&self, sequence: u64) -> Duration {
        let fps = self.config.fps.max(1) as u64;
        Duration::from_micros(sequence * 1_000_000 / fps)
    }
}

impl EncoderSession for PassthroughEncoder {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn encode(&mut self, frame: &RawFrame) -> Result<Vec<EncodedSample>> {
        let gop = self.config.gop_size.max(1);
        let key = self.force_key || self.frames_since_key >= gop;
        if key {
            self.force_key = false;
            self.frames_since_key = 0;
        }
        self.frames_since_key += 1;

        let mut body = [0u8; BODY_LEN + 1];
        body[0..8].copy_from_slice(&frame.sequence.to_be_bytes());
        body[8..16].copy_from_slice(&frame_digest(&frame.data).to_be_bytes());
        body[BODY_LEN] = TRAILING_BITS;
        let escaped = add_emulation_prevention(&body);

        let mut data = BytesMut::with_capacity(4 + 1 + escaped.len());
        data.put_u32(1 + escaped.len() as u32);
        data.put_u8(if key { NAL_IDR } else { NAL_NON_IDR });
        data.put_slice(&escaped);

        trace!(
            "Encoded frame {} as {} picture",
            frame.sequence,
            if key { "key" } else { "delta" }
        );

        Ok(vec![EncodedSample {
            data: data.freeze(),
            not_syncable: if key { None } else { Some(true) },
            format: self.format.clone(),
            sequence: frame.sequence,
            pts: self.pts(frame.sequence),
        }])
    }

    fn request_keyframe(&mut self) {
        self.force_key = true;
    }

    fn config(&self) -> &EncoderConfig {
        &self.config
    }
}

/// Decoder factory for [`PassthroughDecoder`]
#[derive(Debug, Default)]
pub struct PassthroughDecoderFactory;

impl DecoderFactory for PassthroughDecoderFactory {
    fn create(&self, config: &DecoderConfig, sink: PictureSink) -> Result<Box<dyn DecoderSession>> {
        let (width, height) = synthetic_dimensions(&config.sps).unwrap_or((0, 0));
        debug!(
            "Passthrough decoder for {}x{} (profile {})",
            width, height, config.profile_level_id
        );
        Ok(Box::new(PassthroughDecoder {
            sink: Some(sink),
            width,
            height,
            has_reference: false,
        }))
    }

    fn decoder_type(&self) -> &str {
        "passthrough"
    }
}

/// Test-pattern decoding session
pub struct PassthroughDecoder {
    sink: Option<PictureSink>,
    width: u32,
    height: u32,
    has_reference: bool,
}

impl DecoderSession for PassthroughDecoder {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn decode(&mut self, unit: AccessUnit) -> Result<()> {
        let Some(sink) = self.sink.as_ref() else {
            return Err(AppError::Codec("decoder session invalidated".to_string()));
        };

        for nal in iter_length_prefixed(&unit.data) {
            let Some(kind) = NalUnitType::of(nal) else {
                continue;
            };
            if !kind.is_slice() {
                continue;
            }
            if kind == NalUnitType::Idr {
                self.has_reference = true;
            } else if !self.has_reference {
                return Err(AppError::Codec(
                    "delta picture without reference picture".to_string(),
                ));
            }

            let body = remove_emulation_prevention(&nal[1..]);
            if body.len() < BODY_LEN {
                return Err(AppError::Codec(format!(
                    "slice too short ({} bytes)",
                    body.len()
                )));
            }

            let picture = DecodedPicture {
                pts: unit.pts,
                key: unit.key,
                orientation: unit.orientation,
                width: self.width,
                height: self.height,
                data: Bytes::from(body),
            };
            if sink.send(picture).is_err() {
                return Err(AppError::Codec("picture sink closed".to_string()));
            }
        }
        Ok(())
    }

    fn invalidate(&mut self) {
        self.sink = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encoder::FormatDescription;
    use crate::codec::nal::{length_prefixed_to_annex_b, split_annex_b};
    use tokio::sync::mpsc;

    fn config(gop: u32) -> EncoderConfig {
        EncoderConfig {
            width: 256,
            height: 1,
            gop_size: gop,
            ..Default::default()
        }
    }

    #[test]
    fn test_synthetic_sps_round_trip() {
        let sps = synthetic_sps(256, 1);
        assert_eq!(NalUnitType::of(&sps), Some(NalUnitType::Sps));
        assert_eq!(synthetic_dimensions(&sps), Some((256, 1)));
        assert_eq!(synthetic_dimensions(&PPS), None);
    }

    #[test]
    fn test_encoder_gop_and_keyframe_request() {
        let mut encoder = PassthroughEncoderFactory.create(config(3)).unwrap();
        let mut keys = Vec::new();
        for seq in 0..7 {
            let frame = RawFrame::new(vec![seq as u8; 16], 256, 1, seq);
            let samples = encoder.encode(&frame).unwrap();
            keys.push(samples[0].is_key_picture());
        }
        assert_eq!(keys, vec![true, false, false, true, false, false, true]);

        encoder.request_keyframe();
        let sample = &encoder.encode(&RawFrame::new(vec![0], 256, 1, 7)).unwrap()[0];
        assert!(sample.is_key_picture());
        assert_eq!(sample.format.parameter_set_count(), 2);
    }

    #[test]
    fn test_encoded_sample_survives_annex_b() {
        let mut encoder = PassthroughEncoderFactory.create(config(30)).unwrap();
        // Sequence 1 puts 00 00 00 runs into the body
        let sample = &encoder.encode(&RawFrame::new(vec![], 256, 1, 1)).unwrap()[0];
        let mut annex_b = BytesMut::new();
        length_prefixed_to_annex_b(&sample.data, &mut annex_b).unwrap();
        let units = split_annex_b(&annex_b.freeze());
        assert_eq!(units.len(), 1);
    }

    #[test]
    fn test_decoder_recovers_sequence_and_digest() {
        let mut encoder = PassthroughEncoderFactory.create(config(30)).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sps = synthetic_sps(256, 1);
        let decoder_config =
            DecoderConfig::build(&sps, &Bytes::from_static(&PPS), 1).unwrap();
        let mut decoder = PassthroughDecoderFactory.create(&decoder_config, tx).unwrap();

        let data = vec![1u8, 2, 3, 4];
        let sample = &encoder.encode(&RawFrame::new(data.clone(), 256, 1, 42)).unwrap()[0];
        decoder
            .decode(AccessUnit {
                data: sample.data.clone(),
                pts: Duration::ZERO,
                key: true,
                orientation: None,
            })
            .unwrap();

        let picture = rx.try_recv().unwrap();
        assert_eq!(picture_sequence(&picture), Some(42));
        assert_eq!(picture_digest(&picture), Some(frame_digest(&data)));
        assert_eq!((picture.width, picture.height), (256, 1));
    }

    #[test]
    fn test_decoder_rejects_delta_without_reference_and_after_invalidate() {
        let mut encoder = PassthroughEncoderFactory.create(config(30)).unwrap();
        let first = encoder.encode(&RawFrame::new(vec![], 256, 1, 0)).unwrap();
        let second = encoder.encode(&RawFrame::new(vec![], 256, 1, 1)).unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let decoder_config =
            DecoderConfig::build(&synthetic_sps(256, 1), &Bytes::from_static(&PPS), 1).unwrap();
        let mut decoder = PassthroughDecoderFactory.create(&decoder_config, tx).unwrap();

        let unit = |s: &EncodedSample| AccessUnit {
            data: s.data.clone(),
            pts: Duration::ZERO,
            key: s.is_key_picture(),
            orientation: None,
        };
        assert!(decoder.decode(unit(&second[0])).is_err());
        assert!(decoder.decode(unit(&first[0])).is_ok());
        assert!(decoder.decode(unit(&second[0])).is_ok());

        decoder.invalidate();
        assert!(decoder.decode(unit(&first[0])).is_err());
    }
}
