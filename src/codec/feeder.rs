//! Packet reassembler / codec feeder (receiver side)
//!
//! Consumes wire packets, keeps the latest parameter sets, builds a decoder
//! configuration once both are known and feeds pictures into a decoder
//! session. The feeder is not thread-safe on purpose: it lives on the
//! decoder worker (see [`super::worker`]) and every state change happens
//! there.
//!
//! States:
//!
//! ```text
//! Empty -> HasA -> HasB -> ConfigBuilt -> Decoding
//! ```
//!
//! - `HasA`: one of the two parameter sets is stored
//! - `HasB`: both are stored, no valid configuration
//! - `ConfigBuilt`: configuration exists, nothing submitted to the current session
//! - `Decoding`: at least one picture submitted to the current session

use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn, Span};

use super::decoder::{AccessUnit, DecoderConfig, DecoderFactory, DecoderSession, PictureSink};
use super::nal::{split_annex_b, strip_orientation, to_length_prefixed, NalUnitType};
use crate::protocol::{Packet, PacketTag};
use crate::utils::LogThrottler;
use crate::warn_throttled;

/// Reassembler state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeederState {
    Empty,
    HasA,
    HasB,
    ConfigBuilt,
    Decoding,
}

/// Why a packet did not reach the decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// No decoder configuration yet (normal during startup)
    NoConfiguration,
    /// Empty payload, unknown tag or no slice data
    Malformed,
    /// Session creation or submission failed
    CodecFailure,
}

/// Result of feeding one packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedOutcome {
    /// Parameter set stored (configuration may have been rebuilt)
    ParameterSet,
    /// Picture handed to the decoder session
    Submitted,
    Dropped(DropReason),
    /// Not a media packet; the caller routes it
    Forward(Packet),
}

/// Feeder options
#[derive(Debug, Clone, Default)]
pub struct FeederOptions {
    /// Strip a 2-byte orientation prefix from picture payloads that do not start with a start code
    pub orientation_prefix: bool,
}

/// Feeder counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FeederStats {
    pub packets_received: u64,
    pub parameter_set_updates: u64,
    pub config_builds: u64,
    pub sessions_created: u64,
    pub key_pictures: u64,
    pub delta_pictures: u64,
    pub dropped_before_config: u64,
    pub parse_errors: u64,
    pub codec_errors: u64,
}

/// Monotonic wall-clock presentation timestamps
#[derive(Debug)]
struct PtsClock {
    origin: Instant,
    last: Option<Duration>,
}

impl PtsClock {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last: None,
        }
    }

    fn next(&mut self) -> Duration {
        let now = self.origin.elapsed();
        let pts = match self.last {
            Some(last) if now <= last => last + Duration::from_micros(1),
            _ => now,
        };
        self.last = Some(pts);
        pts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParamSlot {
    A,
    B,
}

/// Packet reassembler feeding one decoder session at a time
pub struct CodecFeeder {
    factory: Arc<dyn DecoderFactory>,
    sink: PictureSink,
    options: FeederOptions,
    param_a: Option<Bytes>,
    param_b: Option<Bytes>,
    config: Option<Arc<DecoderConfig>>,
    session: Option<Box<dyn DecoderSession>>,
    submitted: bool,
    generation: u64,
    clock: PtsClock,
    orientation: Option<u16>,
    stats: FeederStats,
    throttler: LogThrottler,
    span: Span,
}

impl CodecFeeder {
    pub fn new(
        factory: Arc<dyn DecoderFactory>,
        sink: PictureSink,
        options: FeederOptions,
        parent: &Span,
    ) -> Self {
        Self {
            factory,
            sink,
            options,
            param_a: None,
            param_b: None,
            config: None,
            session: None,
            submitted: false,
            generation: 0,
            clock: PtsClock::new(),
            orientation: None,
            stats: FeederStats::default(),
            throttler: LogThrottler::with_secs(5),
            span: tracing::debug_span!(parent: parent, "codec_feeder"),
        }
    }

    pub fn state(&self) -> FeederState {
        if self.config.is_some() {
            if self.session.is_some() && self.submitted {
                FeederState::Decoding
            } else {
                FeederState::ConfigBuilt
            }
        } else {
            match (self.param_a.is_some(), self.param_b.is_some()) {
                (false, false) => FeederState::Empty,
                (true, true) => FeederState::HasB,
                _ => FeederState::HasA,
            }
        }
    }

    pub fn stats(&self) -> &FeederStats {
        &self.stats
    }

    pub fn config(&self) -> Option<&Arc<DecoderConfig>> {
        self.config.as_ref()
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    /// Orientation from the most recent prefixed picture
    pub fn orientation(&self) -> Option<u16> {
        self.orientation
    }

    /// Parse and feed a raw transport message
    pub fn feed_bytes(&mut self, data: Bytes) -> FeedOutcome {
        match Packet::parse(data) {
            Ok(packet) => self.feed(packet),
            Err(e) => {
                self.stats.packets_received += 1;
                self.stats.parse_errors += 1;
                warn_throttled!(self.throttler, "parse", "Dropping packet: {}", e);
                FeedOutcome::Dropped(DropReason::Malformed)
            }
        }
    }

    /// Feed one parsed packet
    pub fn feed(&mut self, packet: Packet) -> FeedOutcome {
        let span = self.span.clone();
        let _enter = span.enter();
        self.stats.packets_received += 1;

        match packet.tag() {
            PacketTag::ParamA => self.on_parameter_set(ParamSlot::A, packet.into_payload()),
            PacketTag::ParamB => self.on_parameter_set(ParamSlot::B, packet.into_payload()),
            PacketTag::KeyPicture => self.on_picture(packet.into_payload(), true),
            PacketTag::DeltaPicture => self.on_picture(packet.into_payload(), false),
            _ => FeedOutcome::Forward(packet),
        }
    }

    fn on_parameter_set(&mut self, slot: ParamSlot, value: Bytes) -> FeedOutcome {
        if value.is_empty() {
            self.stats.parse_errors += 1;
            warn_throttled!(self.throttler, "empty_param", "Empty parameter set {:?}", slot);
            return FeedOutcome::Dropped(DropReason::Malformed);
        }
        self.store_parameter_set(slot, value);
        self.try_build_config();
        FeedOutcome::ParameterSet
    }

    /// Store a parameter set; a changed value invalidates the configuration
    fn store_parameter_set(&mut self, slot: ParamSlot, value: Bytes) {
        let stored = match slot {
            ParamSlot::A => &mut self.param_a,
            ParamSlot::B => &mut self.param_b,
        };

        if stored.as_ref() == Some(&value) {
            return;
        }

        let replaced = stored.replace(value).is_some();
        self.stats.parameter_set_updates += 1;

        if self.config.is_some() {
            info!(
                "Parameter set {:?} changed, invalidating decoder configuration",
                slot
            );
            self.config = None;
            self.teardown_session();
        } else if replaced {
            debug!("Parameter set {:?} replaced before configuration was built", slot);
        }
    }

    /// Build the configuration when both sets are known and none is valid.
    ///
    /// Returns whether a configuration exists afterwards.
    fn try_build_config(&mut self) -> bool {
        if self.config.is_some() {
            return true;
        }
        let (Some(sps), Some(pps)) = (self.param_a.as_ref(), self.param_b.as_ref()) else {
            return false;
        };

        match DecoderConfig::build(sps, pps, self.generation + 1) {
            Ok(config) => {
                self.generation = config.generation;
                self.stats.config_builds += 1;
                info!(
                    "Decoder configuration built (profile {}, generation {})",
                    config.profile_level_id, config.generation
                );
                self.config = Some(Arc::new(config));
                self.teardown_session();
                self.create_session();
                true
            }
            Err(e) => {
                self.stats.codec_errors += 1;
                warn!("Failed to build decoder configuration: {}", e);
                false
            }
        }
    }

    fn create_session(&mut self) -> bool {
        let Some(config) = self.config.clone() else {
            return false;
        };

        match self.factory.create(&config, self.sink.clone()) {
            Ok(session) => {
                debug!(
                    "Created {} decoder session (generation {})",
                    session.name(),
                    config.generation
                );
                self.stats.sessions_created += 1;
                self.session = Some(session);
                self.submitted = false;
                self.throttler.clear("decode");
                true
            }
            Err(e) => {
                self.stats.codec_errors += 1;
                warn!(
                    "Failed to create {} decoder session: {}",
                    self.factory.decoder_type(),
                    e
                );
                false
            }
        }
    }

    fn teardown_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.flush() {
                debug!("Decoder flush on teardown failed: {}", e);
            }
            session.invalidate();
            debug!("Decoder session {} torn down", session.name());
        }
        self.submitted = false;
    }

    fn on_picture(&mut self, payload: Bytes, key: bool) -> FeedOutcome {
        let payload = if self.options.orientation_prefix {
            let (orientation, rest) = strip_orientation(payload);
            if orientation.is_some() {
                self.orientation = orientation;
            }
            rest
        } else {
            payload
        };

        // In-band parameter sets take the same path as PARAM_A/PARAM_B
        let mut units = Vec::new();
        let mut saw_parameter_set = false;
        for unit in split_annex_b(&payload) {
            match NalUnitType::of(&unit) {
                Some(NalUnitType::Sps) => {
                    self.store_parameter_set(ParamSlot::A, unit);
                    saw_parameter_set = true;
                }
                Some(NalUnitType::Pps) => {
                    self.store_parameter_set(ParamSlot::B, unit);
                    saw_parameter_set = true;
                }
                _ => units.push(unit),
            }
        }
        if saw_parameter_set {
            self.try_build_config();
        }

        if !units
            .iter()
            .any(|u| NalUnitType::of(u).is_some_and(NalUnitType::is_slice))
        {
            if saw_parameter_set && units.is_empty() {
                return FeedOutcome::ParameterSet;
            }
            self.stats.parse_errors += 1;
            warn_throttled!(
                self.throttler,
                "no_slice",
                "Dropping {} picture without slice data ({} bytes)",
                if key { "key" } else { "delta" },
                payload.len()
            );
            return FeedOutcome::Dropped(DropReason::Malformed);
        }

        if key {
            if !self.try_build_config() {
                self.stats.dropped_before_config += 1;
                debug!("Key picture dropped: no decoder configuration");
                return FeedOutcome::Dropped(DropReason::NoConfiguration);
            }
            if self.session.is_none() && !self.create_session() {
                return FeedOutcome::Dropped(DropReason::CodecFailure);
            }
        } else if self.session.is_none() {
            // Expected until the first key picture after (re)configuration
            self.stats.dropped_before_config += 1;
            return FeedOutcome::Dropped(DropReason::NoConfiguration);
        }

        self.submit(to_length_prefixed(&units), key)
    }

    fn submit(&mut self, data: Bytes, key: bool) -> FeedOutcome {
        let unit = AccessUnit {
            data,
            pts: self.clock.next(),
            key,
            orientation: self.orientation,
        };

        let Some(session) = self.session.as_mut() else {
            return FeedOutcome::Dropped(DropReason::NoConfiguration);
        };

        match session.decode(unit) {
            Ok(()) => {
                self.submitted = true;
                if key {
                    self.stats.key_pictures += 1;
                } else {
                    self.stats.delta_pictures += 1;
                }
                FeedOutcome::Submitted
            }
            Err(e) => {
                self.stats.codec_errors += 1;
                warn_throttled!(
                    self.throttler,
                    "decode",
                    "Decode failed, session will be rebuilt on next key picture: {}",
                    e
                );
                self.teardown_session();
                FeedOutcome::Dropped(DropReason::CodecFailure)
            }
        }
    }

    /// Flush and invalidate the session and forget all configuration.
    ///
    /// Called on the owning worker before codec resources are released.
    pub fn shutdown(&mut self) {
        let span = self.span.clone();
        let _enter = span.enter();
        self.teardown_session();
        self.config = None;
        self.param_a = None;
        self.param_b = None;
        debug!("Codec feeder shut down");
    }
}
