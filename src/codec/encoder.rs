//! Encoder traits and common types

use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::CodecConfig;
use crate::error::{AppError, Result};

/// Encoder configuration
///
/// A change to any field requires a fresh encoding session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Key picture interval in frames
    pub gop_size: u32,
    pub bitrate_kbps: u32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            fps: 30,
            gop_size: 30,
            bitrate_kbps: 2000,
        }
    }
}

impl From<&CodecConfig> for EncoderConfig {
    fn from(config: &CodecConfig) -> Self {
        Self {
            width: config.width,
            height: config.height,
            fps: config.fps,
            gop_size: config.gop_size,
            bitrate_kbps: config.bitrate_kbps,
        }
    }
}

/// Raw picture handed over by the capture pipeline
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub sequence: u64,
    pub captured_at: Instant,
}

impl RawFrame {
    pub fn new(data: impl Into<Bytes>, width: u32, height: u32, sequence: u64) -> Self {
        Self {
            data: data.into(),
            width,
            height,
            sequence,
            captured_at: Instant::now(),
        }
    }
}

/// Codec format description attached to encoder output
///
/// Hardware encoders expose parameter sets through a status-returning
/// accessor; extraction can fail independently of the picture data.
pub trait FormatDescription: Send + Sync + fmt::Debug {
    fn parameter_set_count(&self) -> usize;

    /// Parameter set at `index` (0 = SPS, 1 = PPS), without start code
    fn parameter_set(&self, index: usize) -> Result<Bytes>;
}

/// Format description holding H.264 parameter sets in memory
#[derive(Debug, Clone)]
pub struct H264FormatDescription {
    parameter_sets: Vec<Bytes>,
}

impl H264FormatDescription {
    pub fn new(sps: impl Into<Bytes>, pps: impl Into<Bytes>) -> Self {
        Self {
            parameter_sets: vec![sps.into(), pps.into()],
        }
    }

    /// A description whose parameter sets cannot be read
    pub fn empty() -> Self {
        Self {
            parameter_sets: Vec::new(),
        }
    }
}

impl FormatDescription for H264FormatDescription {
    fn parameter_set_count(&self) -> usize {
        self.parameter_sets.len()
    }

    fn parameter_set(&self, index: usize) -> Result<Bytes> {
        self.parameter_sets.get(index).cloned().ok_or_else(|| {
            AppError::Codec(format!(
                "parameter set {} not available ({} present)",
                index,
                self.parameter_sets.len()
            ))
        })
    }
}

/// One encoder output unit
#[derive(Debug, Clone)]
pub struct EncodedSample {
    /// Access unit in 4-byte big-endian length-prefixed layout
    pub data: Bytes,
    /// Sample attachment: `Some(true)` marks a picture that is not a sync point
    pub not_syncable: Option<bool>,
    pub format: Arc<dyn FormatDescription>,
    pub sequence: u64,
    pub pts: Duration,
}

impl EncodedSample {
    /// Absent or false "not syncable" means a key picture
    pub fn is_key_picture(&self) -> bool {
        !self.not_syncable.unwrap_or(false)
    }
}

/// Encoder session
///
/// Not `Sync`: a session is driven from a single worker.
pub trait EncoderSession: Send {
    fn name(&self) -> &str;

    /// Encode one frame. A session may buffer and return zero or more samples.
    fn encode(&mut self, frame: &RawFrame) -> Result<Vec<EncodedSample>>;

    /// Drain buffered samples
    fn flush(&mut self) -> Result<Vec<EncodedSample>> {
        Ok(vec![])
    }

    /// Make the next output a key picture
    fn request_keyframe(&mut self) {}

    fn config(&self) -> &EncoderConfig;
}

/// Encoder factory
pub trait EncoderFactory: Send + Sync {
    fn create(&self, config: EncoderConfig) -> Result<Box<dyn EncoderSession>>;

    fn encoder_type(&self) -> &str;

    fn is_available(&self) -> bool;

    /// Higher is preferred
    fn priority(&self) -> u32;
}

/// Pick the highest-priority available factory
pub fn select_encoder(factories: &[Arc<dyn EncoderFactory>]) -> Option<Arc<dyn EncoderFactory>> {
    factories
        .iter()
        .filter(|f| f.is_available())
        .max_by_key(|f| f.priority())
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubFactory {
        name: &'static str,
        available: bool,
        priority: u32,
    }

    impl EncoderFactory for StubFactory {
        fn create(&self, _config: EncoderConfig) -> Result<Box<dyn EncoderSession>> {
            Err(AppError::Codec("stub".to_string()))
        }
        fn encoder_type(&self) -> &str {
            self.name
        }
        fn is_available(&self) -> bool {
            self.available
        }
        fn priority(&self) -> u32 {
            self.priority
        }
    }

    #[test]
    fn test_key_picture_from_attachment() {
        let mut sample = EncodedSample {
            data: Bytes::new(),
            not_syncable: None,
            format: Arc::new(H264FormatDescription::empty()),
            sequence: 0,
            pts: Duration::ZERO,
        };
        assert!(sample.is_key_picture());

        sample.not_syncable = Some(false);
        assert!(sample.is_key_picture());

        sample.not_syncable = Some(true);
        assert!(!sample.is_key_picture());
    }

    #[test]
    fn test_format_description_extraction() {
        let desc = H264FormatDescription::new(vec![0x67, 1], vec![0x68, 2]);
        assert_eq!(desc.parameter_set_count(), 2);
        assert_eq!(desc.parameter_set(1).unwrap().as_ref(), &[0x68, 2]);
        assert!(matches!(desc.parameter_set(2), Err(AppError::Codec(_))));
        assert!(H264FormatDescription::empty().parameter_set(0).is_err());
    }

    #[test]
    fn test_select_encoder_prefers_available_priority() {
        let factories: Vec<Arc<dyn EncoderFactory>> = vec![
            Arc::new(StubFactory { name: "sw", available: true, priority: 1 }),
            Arc::new(StubFactory { name: "hw-missing", available: false, priority: 100 }),
            Arc::new(StubFactory { name: "hw", available: true, priority: 10 }),
        ];
        let chosen = select_encoder(&factories).unwrap();
        assert_eq!(chosen.encoder_type(), "hw");

        assert!(select_encoder(&[]).is_none());
    }
}
