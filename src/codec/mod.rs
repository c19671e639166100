//! H.264 media path
//!
//! Sender: [`EncoderWorker`] drives an [`EncoderSession`] and frames its
//! output with the [`FrameCodecAdapter`]. Receiver: [`DecoderWorker`] feeds
//! transport messages through the [`CodecFeeder`] into a [`DecoderSession`].

pub mod adapter;
pub mod decoder;
pub mod encoder;
pub mod feeder;
pub mod nal;
pub mod passthrough;
pub mod worker;

pub use adapter::{AdapterStats, FrameCodecAdapter};
pub use decoder::{
    AccessUnit, DecodedPicture, DecoderConfig, DecoderFactory, DecoderSession, PictureSink,
};
pub use encoder::{
    select_encoder, EncodedSample, EncoderConfig, EncoderFactory, EncoderSession,
    FormatDescription, H264FormatDescription, RawFrame,
};
pub use feeder::{CodecFeeder, DropReason, FeedOutcome, FeederOptions, FeederState, FeederStats};
pub use passthrough::{PassthroughDecoderFactory, PassthroughEncoderFactory};
pub use worker::{DecoderWorker, EncoderStats, EncoderWorker};
