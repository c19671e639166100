//! Transport packet framing
//!
//! Every message on the wire is `[1 byte tag][N bytes payload]`. There is no
//! length prefix: the transport preserves message boundaries per send, and
//! one packet always carries exactly one logical unit.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

use super::reliability::{choose_mode, SendMode};
use crate::error::{AppError, Result};

/// Parameter set A (SPS)
pub const TAG_PARAM_A: u8 = 0x01;
/// Parameter set B (PPS)
pub const TAG_PARAM_B: u8 = 0x02;
/// Self-contained picture (IDR)
pub const TAG_KEY_PICTURE: u8 = 0x03;
/// Picture referencing earlier pictures
pub const TAG_DELTA_PICTURE: u8 = 0x04;
/// Encoded still photo
pub const TAG_PHOTO: u8 = 0x05;
/// Ask the capturing side to take a photo
pub const TAG_CAPTURE_REQUEST: u8 = 0x06;
/// JSON-encoded [`RemoteCommand`](super::command::RemoteCommand)
pub const TAG_COMMAND: u8 = 0x10;

/// Packet type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketTag {
    ParamA = TAG_PARAM_A,
    ParamB = TAG_PARAM_B,
    KeyPicture = TAG_KEY_PICTURE,
    DeltaPicture = TAG_DELTA_PICTURE,
    Photo = TAG_PHOTO,
    CaptureRequest = TAG_CAPTURE_REQUEST,
    Command = TAG_COMMAND,
}

impl PacketTag {
    pub const ALL: [PacketTag; 7] = [
        PacketTag::ParamA,
        PacketTag::ParamB,
        PacketTag::KeyPicture,
        PacketTag::DeltaPicture,
        PacketTag::Photo,
        PacketTag::CaptureRequest,
        PacketTag::Command,
    ];

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            TAG_PARAM_A => Some(PacketTag::ParamA),
            TAG_PARAM_B => Some(PacketTag::ParamB),
            TAG_KEY_PICTURE => Some(PacketTag::KeyPicture),
            TAG_DELTA_PICTURE => Some(PacketTag::DeltaPicture),
            TAG_PHOTO => Some(PacketTag::Photo),
            TAG_CAPTURE_REQUEST => Some(PacketTag::CaptureRequest),
            TAG_COMMAND => Some(PacketTag::Command),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn is_parameter_set(self) -> bool {
        matches!(self, PacketTag::ParamA | PacketTag::ParamB)
    }

    pub fn is_picture(self) -> bool {
        matches!(self, PacketTag::KeyPicture | PacketTag::DeltaPicture)
    }
}

impl fmt::Display for PacketTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PacketTag::ParamA => "PARAM_A",
            PacketTag::ParamB => "PARAM_B",
            PacketTag::KeyPicture => "KEY_PICTURE",
            PacketTag::DeltaPicture => "DELTA_PICTURE",
            PacketTag::Photo => "PHOTO",
            PacketTag::CaptureRequest => "CAPTURE_REQUEST",
            PacketTag::Command => "COMMAND",
        };
        f.write_str(name)
    }
}

/// One framed transport message
///
/// The payload is opaque to this layer and never modified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    tag: PacketTag,
    payload: Bytes,
}

impl Packet {
    /// Build a packet. Holds the payload by reference count, no copy.
    pub fn frame(tag: PacketTag, payload: impl Into<Bytes>) -> Self {
        Self {
            tag,
            payload: payload.into(),
        }
    }

    pub fn tag(&self) -> PacketTag {
        self.tag
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Total wire size including the tag byte
    pub fn wire_len(&self) -> usize {
        1 + self.payload.len()
    }

    /// Serialize to `[tag][payload]`
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        buf.put_u8(self.tag.as_byte());
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Parse a received message. The payload is a zero-copy slice of `data`.
    pub fn parse(data: Bytes) -> Result<Self> {
        let Some(&first) = data.first() else {
            return Err(AppError::Parse("empty packet".to_string()));
        };

        let tag = PacketTag::from_byte(first)
            .ok_or_else(|| AppError::Parse(format!("unknown packet tag 0x{:02X}", first)))?;

        Ok(Self {
            tag,
            payload: data.slice(1..),
        })
    }

    /// Channel mode this packet must travel on
    pub fn mode(&self) -> SendMode {
        choose_mode(&[self.tag.as_byte()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout() {
        let packet = Packet::frame(PacketTag::ParamA, vec![0x67, 0x01, 0x02]);
        assert_eq!(packet.to_bytes().as_ref(), &[TAG_PARAM_A, 0x67, 0x01, 0x02]);
        assert_eq!(packet.wire_len(), 4);
    }

    #[test]
    fn test_parse_is_zero_copy_slice() {
        let wire = Bytes::from_static(&[TAG_KEY_PICTURE, 0, 0, 0, 1, 0x65, 0xAA]);
        let packet = Packet::parse(wire.clone()).unwrap();

        assert_eq!(packet.tag(), PacketTag::KeyPicture);
        assert_eq!(packet.payload().as_ref(), &wire[1..]);
        assert_eq!(packet.payload().as_ptr(), wire[1..].as_ptr());
    }

    #[test]
    fn test_tag_only_packet_has_empty_payload() {
        let packet = Packet::parse(Bytes::from_static(&[TAG_CAPTURE_REQUEST])).unwrap();
        assert_eq!(packet.tag(), PacketTag::CaptureRequest);
        assert!(packet.payload().is_empty());
    }

    #[test]
    fn test_parse_rejects_empty_and_unknown() {
        let err = Packet::parse(Bytes::new()).unwrap_err();
        assert!(matches!(err, AppError::Parse(_)));

        let err = Packet::parse(Bytes::from_static(&[0x7F, 1, 2])).unwrap_err();
        assert!(err.to_string().contains("0x7F"));
    }

    #[test]
    fn test_tag_bytes_are_distinct() {
        for tag in PacketTag::ALL {
            assert_eq!(PacketTag::from_byte(tag.as_byte()), Some(tag));
        }
        assert_eq!(PacketTag::from_byte(0x00), None);
    }
}
