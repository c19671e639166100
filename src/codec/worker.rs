//! Dedicated codec workers
//!
//! Each worker owns its codec session exclusively and processes commands
//! from an mpsc queue in order, so codec state is never touched from two
//! places at once. `shutdown()` is acknowledged over a oneshot once the
//! session has been released on the worker.

use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn, Instrument, Span};

use super::adapter::{AdapterStats, FrameCodecAdapter};
use super::encoder::{EncoderConfig, EncoderFactory, EncoderSession, EncodedSample, RawFrame};
use super::feeder::{CodecFeeder, FeedOutcome, FeederState, FeederStats};
use crate::error::{AppError, Result};
use crate::protocol::Packet;
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// Encoder command queue capacity (frames)
const ENCODER_QUEUE_CAPACITY: usize = 8;
/// Decoder command queue capacity (packets)
const DECODER_QUEUE_CAPACITY: usize = 256;

/// Encoder worker counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct EncoderStats {
    pub frames_submitted: u64,
    pub frames_encoded: u64,
    pub frames_dropped: u64,
    pub sessions_created: u64,
    pub encode_errors: u64,
    pub adapter: AdapterStats,
}

enum EncoderCommand {
    Frame(RawFrame),
    Reconfigure(EncoderConfig, oneshot::Sender<Result<()>>),
    RequestKeyFrame,
    SetOrientation(Option<u16>),
    Stats(oneshot::Sender<EncoderStats>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the encoding worker
pub struct EncoderWorker {
    tx: mpsc::Sender<EncoderCommand>,
}

impl EncoderWorker {
    /// Spawn the worker. Packets are sent to `output` in wire order.
    pub fn spawn(
        factory: Arc<dyn EncoderFactory>,
        config: EncoderConfig,
        adapter: FrameCodecAdapter,
        output: mpsc::Sender<Packet>,
        parent: &Span,
    ) -> Self {
        let (tx, rx) = mpsc::channel(ENCODER_QUEUE_CAPACITY);
        let span = tracing::info_span!(
            parent: parent,
            "encoder_worker",
            encoder = factory.encoder_type()
        );
        let state = EncoderState {
            factory,
            config,
            session: None,
            adapter,
            output,
            stats: EncoderStats::default(),
            throttler: LogThrottler::with_secs(5),
        };
        tokio::spawn(state.run(rx).instrument(span));
        Self { tx }
    }

    /// Queue a frame, waiting for queue space
    pub async fn submit(&self, frame: RawFrame) -> Result<()> {
        self.tx
            .send(EncoderCommand::Frame(frame))
            .await
            .map_err(|_| AppError::Internal("encoder worker stopped".to_string()))
    }

    /// Queue a frame without waiting. Returns false if the frame was dropped.
    pub fn try_submit(&self, frame: RawFrame) -> bool {
        self.tx.try_send(EncoderCommand::Frame(frame)).is_ok()
    }

    /// Switch to a new configuration. A new encoding session is started
    /// and parameter sets go out again with its first key picture.
    pub async fn reconfigure(&self, config: EncoderConfig) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.command(EncoderCommand::Reconfigure(config, ack_tx)).await?;
        ack_rx
            .await
            .map_err(|_| AppError::Internal("encoder worker stopped".to_string()))?
    }

    pub async fn request_keyframe(&self) -> Result<()> {
        self.command(EncoderCommand::RequestKeyFrame).await
    }

    pub async fn set_orientation(&self, orientation: Option<u16>) -> Result<()> {
        self.command(EncoderCommand::SetOrientation(orientation)).await
    }

    pub async fn stats(&self) -> Result<EncoderStats> {
        let (tx, rx) = oneshot::channel();
        self.command(EncoderCommand::Stats(tx)).await?;
        rx.await
            .map_err(|_| AppError::Internal("encoder worker stopped".to_string()))
    }

    /// Discard queued frames, flush and release the session.
    ///
    /// Idempotent: returns immediately if the worker is already gone.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(EncoderCommand::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    async fn command(&self, cmd: EncoderCommand) -> Result<()> {
        self.tx
            .send(cmd)
            .await
            .map_err(|_| AppError::Internal("encoder worker stopped".to_string()))
    }
}

struct EncoderState {
    factory: Arc<dyn EncoderFactory>,
    config: EncoderConfig,
    session: Option<Box<dyn EncoderSession>>,
    adapter: FrameCodecAdapter,
    output: mpsc::Sender<Packet>,
    stats: EncoderStats,
    throttler: LogThrottler,
}

impl EncoderState {
    async fn run(mut self, mut rx: mpsc::Receiver<EncoderCommand>) {
        info!(
            "Encoder worker started ({}x{} @ {} fps)",
            self.config.width, self.config.height, self.config.fps
        );

        while let Some(cmd) = rx.recv().await {
            match cmd {
                EncoderCommand::Frame(frame) => {
                    self.stats.frames_submitted += 1;
                    if !self.encode(&frame).await {
                        break;
                    }
                }
                EncoderCommand::Reconfigure(config, ack) => {
                    let result = self.reconfigure(config).await;
                    let _ = ack.send(result);
                }
                EncoderCommand::RequestKeyFrame => {
                    if let Some(session) = self.session.as_mut() {
                        session.request_keyframe();
                    }
                }
                EncoderCommand::SetOrientation(orientation) => {
                    self.adapter.set_orientation(orientation);
                }
                EncoderCommand::Stats(reply) => {
                    let _ = reply.send(self.snapshot());
                }
                EncoderCommand::Shutdown(ack) => {
                    let mut discarded = 0u64;
                    while let Ok(cmd) = rx.try_recv() {
                        if let EncoderCommand::Frame(_) = cmd {
                            discarded += 1;
                        }
                    }
                    self.stats.frames_dropped += discarded;
                    self.release_session();
                    info!("Encoder worker stopped ({} queued frames discarded)", discarded);
                    let _ = ack.send(());
                    return;
                }
            }
        }

        self.release_session();
        debug!("Encoder worker exiting");
    }

    fn snapshot(&self) -> EncoderStats {
        let mut stats = self.stats.clone();
        stats.adapter = self.adapter.stats().clone();
        stats
    }

    fn ensure_session(&mut self) -> Result<()> {
        if self.session.is_none() {
            let session = self.factory.create(self.config.clone())?;
            debug!("Created {} encoding session", session.name());
            self.session = Some(session);
            self.stats.sessions_created += 1;
            self.adapter.reset_session();
        }
        Ok(())
    }

    /// Returns false once the output side has gone away
    async fn encode(&mut self, frame: &RawFrame) -> bool {
        if let Err(e) = self.ensure_session() {
            self.stats.frames_dropped += 1;
            self.stats.encode_errors += 1;
            warn_throttled!(self.throttler, "create", "Cannot create encoder session: {}", e);
            return true;
        }

        let Some(session) = self.session.as_mut() else {
            return true;
        };

        match session.encode(frame) {
            Ok(samples) => {
                self.stats.frames_encoded += 1;
                self.emit(samples).await
            }
            Err(e) => {
                self.stats.frames_dropped += 1;
                self.stats.encode_errors += 1;
                warn_throttled!(
                    self.throttler,
                    "encode",
                    "Encoding frame {} failed, restarting session: {}",
                    frame.sequence,
                    e
                );
                self.session = None;
                true
            }
        }
    }

    async fn emit(&mut self, samples: Vec<EncodedSample>) -> bool {
        for sample in &samples {
            for packet in self.adapter.process(sample) {
                if self.output.send(packet).await.is_err() {
                    debug!("Encoder output closed");
                    return false;
                }
            }
        }
        true
    }

    async fn reconfigure(&mut self, config: EncoderConfig) -> Result<()> {
        if config == self.config && self.session.is_some() {
            return Ok(());
        }
        info!(
            "Reconfiguring encoder: {}x{} @ {} fps, {} kbps",
            config.width, config.height, config.fps, config.bitrate_kbps
        );

        if let Some(mut session) = self.session.take() {
            match session.flush() {
                Ok(samples) => {
                    self.emit(samples).await;
                }
                Err(e) => debug!("Encoder flush failed: {}", e),
            }
        }
        self.config = config;
        self.ensure_session()
    }

    fn release_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            match session.flush() {
                Ok(samples) => {
                    for sample in &samples {
                        for packet in self.adapter.process(sample) {
                            let _ = self.output.try_send(packet);
                        }
                    }
                }
                Err(e) => debug!("Encoder flush on shutdown failed: {}", e),
            }
            debug!("Encoding session {} released", session.name());
        }
    }
}

enum DecoderCommand {
    Packet(Bytes),
    Stats(oneshot::Sender<FeederStats>),
    State(oneshot::Sender<FeederState>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the decoding worker
pub struct DecoderWorker {
    tx: mpsc::Sender<DecoderCommand>,
}

impl DecoderWorker {
    /// Spawn the worker around `feeder`.
    ///
    /// Non-media packets (photo, capture request, command) are passed to
    /// `forward` when given, otherwise dropped.
    pub fn spawn(
        feeder: CodecFeeder,
        forward: Option<mpsc::UnboundedSender<Packet>>,
        parent: &Span,
    ) -> Self {
        let (tx, rx) = mpsc::channel(DECODER_QUEUE_CAPACITY);
        let span = tracing::info_span!(parent: parent, "decoder_worker");
        tokio::spawn(run_decoder(feeder, forward, rx).instrument(span));
        Self { tx }
    }

    /// Hand a raw transport message to the feeder
    pub async fn deliver(&self, data: Bytes) -> Result<()> {
        self.tx
            .send(DecoderCommand::Packet(data))
            .await
            .map_err(|_| AppError::Internal("decoder worker stopped".to_string()))
    }

    pub async fn stats(&self) -> Result<FeederStats> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(DecoderCommand::Stats(tx))
            .await
            .map_err(|_| AppError::Internal("decoder worker stopped".to_string()))?;
        rx.await
            .map_err(|_| AppError::Internal("decoder worker stopped".to_string()))
    }

    pub async fn state(&self) -> Result<FeederState> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(DecoderCommand::State(tx))
            .await
            .map_err(|_| AppError::Internal("decoder worker stopped".to_string()))?;
        rx.await
            .map_err(|_| AppError::Internal("decoder worker stopped".to_string()))
    }

    /// Invalidate the decoder session and stop. Packets queued before the
    /// call are still processed.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(DecoderCommand::Shutdown(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }
}

async fn run_decoder(
    mut feeder: CodecFeeder,
    forward: Option<mpsc::UnboundedSender<Packet>>,
    mut rx: mpsc::Receiver<DecoderCommand>,
) {
    debug!("Decoder worker started");

    while let Some(cmd) = rx.recv().await {
        match cmd {
            DecoderCommand::Packet(data) => {
                if let FeedOutcome::Forward(packet) = feeder.feed_bytes(data) {
                    match forward.as_ref() {
                        Some(tx) => {
                            let _ = tx.send(packet);
                        }
                        None => debug!("No consumer for {} packet", packet.tag()),
                    }
                }
            }
            DecoderCommand::Stats(reply) => {
                let _ = reply.send(feeder.stats().clone());
            }
            DecoderCommand::State(reply) => {
                let _ = reply.send(feeder.state());
            }
            DecoderCommand::Shutdown(ack) => {
                feeder.shutdown();
                info!(
                    "Decoder worker stopped ({} key / {} delta pictures decoded)",
                    feeder.stats().key_pictures,
                    feeder.stats().delta_pictures
                );
                let _ = ack.send(());
                return;
            }
        }
    }

    feeder.shutdown();
    debug!("Decoder worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::feeder::FeederOptions;
    use crate::codec::passthrough::{
        picture_sequence, PassthroughDecoderFactory, PassthroughEncoderFactory,
    };
    use crate::protocol::PacketTag;

    fn encoder_config() -> EncoderConfig {
        EncoderConfig {
            width: 64,
            height: 48,
            fps: 30,
            gop_size: 5,
            bitrate_kbps: 100,
        }
    }

    fn spawn_encoder(capacity: usize) -> (EncoderWorker, mpsc::Receiver<Packet>) {
        let (tx, rx) = mpsc::channel(capacity);
        let worker = EncoderWorker::spawn(
            Arc::new(PassthroughEncoderFactory),
            encoder_config(),
            FrameCodecAdapter::new(&Span::none()),
            tx,
            &Span::none(),
        );
        (worker, rx)
    }

    #[tokio::test]
    async fn test_encoder_worker_emits_parameter_sets_first() {
        let (worker, mut rx) = spawn_encoder(64);

        for seq in 0..6 {
            worker.submit(RawFrame::new(vec![seq as u8], 64, 48, seq)).await.unwrap();
        }

        let mut tags = Vec::new();
        for _ in 0..8 {
            tags.push(rx.recv().await.unwrap().tag());
        }
        assert_eq!(
            &tags[..3],
            &[PacketTag::ParamA, PacketTag::ParamB, PacketTag::KeyPicture]
        );
        assert_eq!(tags[3], PacketTag::DeltaPicture);
        // gop 5: frame 5 is the next key picture, without parameter sets
        assert_eq!(tags[7], PacketTag::KeyPicture);

        let stats = worker.stats().await.unwrap();
        assert_eq!(stats.frames_encoded, 6);
        assert_eq!(stats.adapter.parameter_sets_sent, 1);
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_encoder_reconfigure_resends_parameter_sets() {
        let (worker, mut rx) = spawn_encoder(64);
        worker.submit(RawFrame::new(vec![0], 64, 48, 0)).await.unwrap();
        for _ in 0..3 {
            rx.recv().await.unwrap();
        }

        let mut config = encoder_config();
        config.width = 128;
        worker.reconfigure(config).await.unwrap();
        worker.submit(RawFrame::new(vec![1], 128, 48, 1)).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().tag(), PacketTag::ParamA);
        assert_eq!(rx.recv().await.unwrap().tag(), PacketTag::ParamB);
        assert_eq!(rx.recv().await.unwrap().tag(), PacketTag::KeyPicture);

        let mut broken = encoder_config();
        broken.width = 0;
        assert!(worker.reconfigure(broken).await.is_err());
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_encoder_shutdown_is_acknowledged_and_idempotent() {
        let (worker, _rx) = spawn_encoder(64);
        worker.shutdown().await;
        worker.shutdown().await;
        assert!(worker.submit(RawFrame::new(vec![0], 64, 48, 0)).await.is_err());
    }

    #[tokio::test]
    async fn test_decoder_worker_pipeline() {
        let (packet_tx, mut packet_rx) = mpsc::channel(64);
        let encoder = EncoderWorker::spawn(
            Arc::new(PassthroughEncoderFactory),
            encoder_config(),
            FrameCodecAdapter::new(&Span::none()),
            packet_tx,
            &Span::none(),
        );

        let (picture_tx, mut picture_rx) = mpsc::unbounded_channel();
        let (forward_tx, mut forward_rx) = mpsc::unbounded_channel();
        let feeder = CodecFeeder::new(
            Arc::new(PassthroughDecoderFactory),
            picture_tx,
            FeederOptions::default(),
            &Span::none(),
        );
        let decoder = DecoderWorker::spawn(feeder, Some(forward_tx), &Span::none());

        for seq in 0..10 {
            encoder.submit(RawFrame::new(vec![seq as u8; 8], 64, 48, seq)).await.unwrap();
        }
        // 10 pictures + 2 parameter sets
        for _ in 0..12 {
            let packet = packet_rx.recv().await.unwrap();
            decoder.deliver(packet.to_bytes()).await.unwrap();
        }
        decoder
            .deliver(Packet::frame(PacketTag::Photo, vec![0xFF, 0xD8]).to_bytes())
            .await
            .unwrap();

        for seq in 0..10 {
            let picture = picture_rx.recv().await.unwrap();
            assert_eq!(picture_sequence(&picture), Some(seq));
            assert_eq!((picture.width, picture.height), (64, 48));
        }
        assert_eq!(forward_rx.recv().await.unwrap().tag(), PacketTag::Photo);
        assert_eq!(decoder.state().await.unwrap(), FeederState::Decoding);

        decoder.shutdown().await;
        assert!(decoder.stats().await.is_err());
        encoder.shutdown().await;
    }
}
