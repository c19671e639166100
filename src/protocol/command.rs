//! Remote command protocol
//!
//! Small control messages carried on the command channel as `COMMAND`
//! packets with a JSON body. The enum is closed: anything this build does
//! not know decodes to [`RemoteCommand::Unknown`] instead of failing, so
//! newer peers can add commands without breaking older ones.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::packet::{Packet, PacketTag};
use crate::error::{AppError, Result};

/// Maximum accepted command body (64 KB)
pub const MAX_COMMAND_SIZE: usize = 64 * 1024;

/// Capture mode of the sending device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    Photo,
    Video,
}

/// Commands exchanged between peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RemoteCommand {
    /// Keep-alive
    Heartbeat,
    /// Take a still photo now
    CapturePhoto,
    /// Start sending pictures on the streaming channel
    StartStreaming,
    /// Stop sending pictures
    StopStreaming,
    /// Switch between photo and video capture
    SwitchMode { mode: CaptureMode },
    /// Ask the encoder to emit a key picture (receiver lost sync)
    RequestKeyFrame,
    /// Any command this build does not understand
    #[serde(other)]
    Unknown,
}

impl RemoteCommand {
    /// Encode as a `COMMAND` packet
    pub fn to_packet(&self) -> Result<Packet> {
        let body = serde_json::to_vec(self)?;
        Ok(Packet::frame(PacketTag::Command, body))
    }

    /// Decode the body of a `COMMAND` packet
    pub fn from_payload(payload: &Bytes) -> Result<Self> {
        if payload.len() > MAX_COMMAND_SIZE {
            return Err(AppError::Parse(format!(
                "command body too large: {} bytes",
                payload.len()
            )));
        }
        Ok(serde_json::from_slice(payload)?)
    }

    /// Decode a packet, accepting both `COMMAND` and bare `CAPTURE_REQUEST`
    pub fn from_packet(packet: &Packet) -> Result<Self> {
        match packet.tag() {
            PacketTag::Command => Self::from_payload(packet.payload()),
            PacketTag::CaptureRequest => Ok(RemoteCommand::CapturePhoto),
            other => Err(AppError::Parse(format!("{} is not a command packet", other))),
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self, RemoteCommand::Heartbeat)
    }
}
