//! H.264 NAL unit helpers
//!
//! Encoders hand out access units in the length-prefixed layout (each NAL
//! unit preceded by a 4-byte big-endian length, "AVCC"); the wire carries the
//! byte-stream layout (each NAL unit preceded by `00 00 00 01`, "Annex B");
//! decoders want the length-prefixed layout back. This module converts
//! between the two and classifies units.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{AppError, Result};

/// 4-byte Annex B start code
pub const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

/// Size of the length header in the length-prefixed layout
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Size of the optional orientation prefix on picture payloads
pub const ORIENTATION_PREFIX_SIZE: usize = 2;

/// H.264 NAL unit type (`header & 0x1F`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NalUnitType {
    /// Coded slice of a non-IDR picture
    NonIdr,
    /// Coded slice of an IDR picture
    Idr,
    /// Supplemental enhancement information
    Sei,
    /// Sequence parameter set
    Sps,
    /// Picture parameter set
    Pps,
    /// Access unit delimiter
    Aud,
    /// Filler data
    Filler,
    Other(u8),
}

impl From<u8> for NalUnitType {
    fn from(header: u8) -> Self {
        match header & 0x1F {
            1 => NalUnitType::NonIdr,
            5 => NalUnitType::Idr,
            6 => NalUnitType::Sei,
            7 => NalUnitType::Sps,
            8 => NalUnitType::Pps,
            9 => NalUnitType::Aud,
            12 => NalUnitType::Filler,
            other => NalUnitType::Other(other),
        }
    }
}

impl NalUnitType {
    /// Classify a NAL unit by its first (header) byte
    pub fn of(nal: &[u8]) -> Option<Self> {
        nal.first().map(|&b| NalUnitType::from(b))
    }

    pub fn is_parameter_set(self) -> bool {
        matches!(self, NalUnitType::Sps | NalUnitType::Pps)
    }

    pub fn is_slice(self) -> bool {
        matches!(self, NalUnitType::Idr | NalUnitType::NonIdr)
    }
}

/// Whether `data` opens with the 4-byte start code
pub fn starts_with_start_code(data: &[u8]) -> bool {
    data.len() >= START_CODE.len() && data[..START_CODE.len()] == START_CODE
}

/// Append the Annex B form of a length-prefixed access unit to `out`.
///
/// Walks the 4-byte big-endian length headers and copies each unit behind a
/// start code. Returns the number of units written. If a header points past
/// the end of the buffer, the units before it stay in `out` and a parse
/// error is returned.
pub fn length_prefixed_to_annex_b(data: &[u8], out: &mut BytesMut) -> Result<usize> {
    let mut pos = 0;
    let mut count = 0;

    while pos < data.len() {
        if pos + LENGTH_PREFIX_SIZE > data.len() {
            return Err(AppError::Parse(format!(
                "truncated length header at offset {} ({} bytes left)",
                pos,
                data.len() - pos
            )));
        }

        let len = u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
            as usize;
        pos += LENGTH_PREFIX_SIZE;

        if len > data.len() - pos {
            return Err(AppError::Parse(format!(
                "NAL unit length {} exceeds remaining {} bytes",
                len,
                data.len() - pos
            )));
        }

        if len > 0 {
            out.reserve(START_CODE.len() + len);
            out.put_slice(&START_CODE);
            out.put_slice(&data[pos..pos + len]);
            count += 1;
        }
        pos += len;
    }

    Ok(count)
}

/// Split an Annex B byte stream into NAL units (start codes removed).
///
/// Accepts both 3- and 4-byte start codes. Leading bytes before the first
/// start code are ignored. The returned units share `data`'s buffer.
pub fn split_annex_b(data: &Bytes) -> Vec<Bytes> {
    let mut units = Vec::new();
    let len = data.len();
    let mut i = 0;

    let start_code_at = |i: usize| -> Option<usize> {
        if i + 3 < len && data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 0 && data[i + 3] == 1
        {
            Some(4)
        } else if i + 2 < len && data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            Some(3)
        } else {
            None
        }
    };

    // Find the first start code
    let mut nal_start = None;
    while i < len {
        if let Some(sc) = start_code_at(i) {
            i += sc;
            nal_start = Some(i);
            break;
        }
        i += 1;
    }
    let Some(mut nal_start) = nal_start else {
        return units;
    };

    while i < len {
        if let Some(sc) = start_code_at(i) {
            if i > nal_start {
                units.push(data.slice(nal_start..i));
            }
            i += sc;
            nal_start = i;
        } else {
            i += 1;
        }
    }

    if nal_start < len {
        units.push(data.slice(nal_start..len));
    }

    units
}

/// Re-wrap NAL units into the length-prefixed layout
pub fn to_length_prefixed<'a, I>(units: I) -> Bytes
where
    I: IntoIterator<Item = &'a Bytes>,
{
    let mut out = BytesMut::new();
    for unit in units {
        out.reserve(LENGTH_PREFIX_SIZE + unit.len());
        out.put_u32(unit.len() as u32);
        out.put_slice(unit);
    }
    out.freeze()
}

/// Iterate over the units of a length-prefixed buffer.
///
/// Stops at the first malformed header.
pub fn iter_length_prefixed(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    let mut pos = 0;
    std::iter::from_fn(move || {
        if pos + LENGTH_PREFIX_SIZE > data.len() {
            return None;
        }
        let len = u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
            as usize;
        let start = pos + LENGTH_PREFIX_SIZE;
        if len > data.len() - start {
            return None;
        }
        pos = start + len;
        Some(&data[start..start + len])
    })
}

/// Prefix a picture payload with a little-endian orientation value
pub fn prepend_orientation(orientation: u16, payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(ORIENTATION_PREFIX_SIZE + payload.len());
    out.put_u16_le(orientation);
    out.put_slice(payload);
    out.freeze()
}

/// Strip an orientation prefix if the payload carries one.
///
/// A payload that already begins with a 4-byte start code has no prefix.
/// Otherwise, if it is long enough to hold a prefix plus a start code, the
/// first two bytes are the orientation. Shorter payloads are returned as-is.
pub fn strip_orientation(payload: Bytes) -> (Option<u16>, Bytes) {
    if starts_with_start_code(&payload)
        || payload.len() < ORIENTATION_PREFIX_SIZE + START_CODE.len()
    {
        return (None, payload);
    }
    let orientation = u16::from_le_bytes([payload[0], payload[1]]);
    (Some(orientation), payload.slice(ORIENTATION_PREFIX_SIZE..))
}

/// profile-level-id (`"42e01f"` style) from an SPS without start code.
///
/// Missing bytes read as zero, so truncated test SPS still yield an id.
pub fn profile_level_id(sps: &[u8]) -> String {
    let byte = |i: usize| sps.get(i).copied().unwrap_or(0);
    format!("{:02x}{:02x}{:02x}", byte(1), byte(2), byte(3))
}

/// Build an AVC decoder configuration record (`avcC` body) from one SPS and one PPS.
pub fn build_avc_decoder_record(sps: &[u8], pps: &[u8]) -> Result<Bytes> {
    if NalUnitType::of(sps) != Some(NalUnitType::Sps) {
        return Err(AppError::Codec(format!(
            "parameter set A is not an SPS (header {:02X?})",
            sps.first()
        )));
    }
    if NalUnitType::of(pps) != Some(NalUnitType::Pps) {
        return Err(AppError::Codec(format!(
            "parameter set B is not a PPS (header {:02X?})",
            pps.first()
        )));
    }
    if sps.len() > u16::MAX as usize || pps.len() > u16::MAX as usize {
        return Err(AppError::Codec("parameter set exceeds 65535 bytes".to_string()));
    }

    let byte = |i: usize| sps.get(i).copied().unwrap_or(0);
    let mut record = BytesMut::with_capacity(11 + sps.len() + pps.len());
    record.put_u8(1); // configurationVersion
    record.put_u8(byte(1)); // AVCProfileIndication
    record.put_u8(byte(2)); // profile_compatibility
    record.put_u8(byte(3)); // AVCLevelIndication
    record.put_u8(0xFC | (LENGTH_PREFIX_SIZE as u8 - 1)); // lengthSizeMinusOne
    record.put_u8(0xE0 | 1); // numOfSequenceParameterSets
    record.put_u16(sps.len() as u16);
    record.put_slice(sps);
    record.put_u8(1); // numOfPictureParameterSets
    record.put_u16(pps.len() as u16);
    record.put_slice(pps);
    Ok(record.freeze())
}

/// Insert emulation-prevention bytes so the payload contains no start code.
///
/// A `0x03` is inserted after every two consecutive zero bytes that are
/// followed by a byte `<= 0x03`.
pub fn add_emulation_prevention(rbsp: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(rbsp.len() + rbsp.len() / 64);
    let mut zeros = 0;
    for &b in rbsp {
        if zeros >= 2 && b <= 0x03 {
            out.push(0x03);
            zeros = 0;
        }
        out.push(b);
        zeros = if b == 0 { zeros + 1 } else { 0 };
    }
    out
}

/// Remove emulation-prevention bytes (`00 00 03` becomes `00 00`)
pub fn remove_emulation_prevention(ebsp: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ebsp.len());
    let mut zeros = 0;
    for &b in ebsp {
        if zeros >= 2 && b == 0x03 {
            zeros = 0;
            continue;
        }
        out.push(b);
        zeros = if b == 0 { zeros + 1 } else { 0 };
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn avcc(units: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for u in units {
            out.extend_from_slice(&(u.len() as u32).to_be_bytes());
            out.extend_from_slice(u);
        }
        out
    }

    #[test]
    fn test_nal_type_masks_header() {
        assert_eq!(NalUnitType::from(0x67), NalUnitType::Sps);
        assert_eq!(NalUnitType::from(0x68), NalUnitType::Pps);
        assert_eq!(NalUnitType::from(0x65), NalUnitType::Idr);
        assert_eq!(NalUnitType::from(0x41), NalUnitType::NonIdr);
        assert_eq!(NalUnitType::from(0x7F), NalUnitType::Other(31));
        assert!(NalUnitType::Idr.is_slice());
        assert!(NalUnitType::Pps.is_parameter_set());
        assert_eq!(NalUnitType::of(&[]), None);
    }

    #[test]
    fn test_length_prefixed_to_annex_b() {
        let data = avcc(&[&[0x65, 0xAA, 0xBB], &[0x06, 0x01]]);
        let mut out = BytesMut::new();

        let count = length_prefixed_to_annex_b(&data, &mut out).unwrap();
        assert_eq!(count, 2);
        assert_eq!(
            out.as_ref(),
            &[0, 0, 0, 1, 0x65, 0xAA, 0xBB, 0, 0, 0, 1, 0x06, 0x01]
        );
    }

    #[test]
    fn test_truncated_length_keeps_valid_prefix() {
        let mut data = avcc(&[&[0x41, 0x01]]);
        data.extend_from_slice(&[0, 0, 0, 9, 0x41]);
        let mut out = BytesMut::new();

        let err = length_prefixed_to_annex_b(&data, &mut out).unwrap_err();
        assert!(matches!(err, AppError::Parse(_)));
        assert_eq!(out.as_ref(), &[0, 0, 0, 1, 0x41, 0x01]);

        let mut out = BytesMut::new();
        assert!(length_prefixed_to_annex_b(&[0, 0], &mut out).is_err());
        assert!(out.is_empty());
    }

    #[test]
    fn test_split_annex_b_mixed_start_codes() {
        let data = Bytes::from_static(&[
            0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1f, // SPS
            0, 0, 1, 0x68, 0xce, 0x38, 0x80, // PPS, 3-byte start code
            0, 0, 0, 1, 0x65, 0x88, 0x84, // IDR
        ]);
        let units = split_annex_b(&data);

        assert_eq!(units.len(), 3);
        assert_eq!(units[0].as_ref(), &[0x67, 0x42, 0x00, 0x1f]);
        assert_eq!(units[1].as_ref(), &[0x68, 0xce, 0x38, 0x80]);
        assert_eq!(units[2].as_ref(), &[0x65, 0x88, 0x84]);
    }

    #[test]
    fn test_split_annex_b_without_start_code() {
        assert!(split_annex_b(&Bytes::from_static(&[0x65, 0xAA])).is_empty());
        assert!(split_annex_b(&Bytes::new()).is_empty());
        assert!(split_annex_b(&Bytes::from_static(&[0, 0, 0, 1])).is_empty());
    }

    #[test]
    fn test_annex_b_back_to_length_prefixed() {
        let original = avcc(&[&[0x65, 0xAA, 0xBB], &[0x41, 0x9A]]);
        let mut annex_b = BytesMut::new();
        length_prefixed_to_annex_b(&original, &mut annex_b).unwrap();

        let units = split_annex_b(&annex_b.freeze());
        assert_eq!(to_length_prefixed(&units).as_ref(), original.as_slice());

        let collected: Vec<&[u8]> = iter_length_prefixed(&original).collect();
        assert_eq!(collected, vec![&[0x65, 0xAA, 0xBB][..], &[0x41, 0x9A][..]]);
    }

    #[test]
    fn test_orientation_prefix() {
        let payload = Bytes::from_static(&[0, 0, 0, 1, 0x65, 0xAA]);
        assert_eq!(strip_orientation(payload.clone()), (None, payload.clone()));

        let prefixed = prepend_orientation(3, &payload);
        assert_eq!(&prefixed[..2], &[3, 0]);
        let (orientation, stripped) = strip_orientation(prefixed);
        assert_eq!(orientation, Some(3));
        assert_eq!(stripped, payload);

        // Orientation 0 looks like the start of a start code but is still stripped
        let (orientation, stripped) = strip_orientation(prepend_orientation(0, &payload));
        assert_eq!(orientation, Some(0));
        assert_eq!(stripped, payload);

        // Too short to carry prefix + start code
        let short = Bytes::from_static(&[1, 0, 0x65]);
        assert_eq!(strip_orientation(short.clone()), (None, short));
    }

    #[test]
    fn test_avc_decoder_record() {
        let sps = [0x67, 0x64, 0x00, 0x1f, 0xac];
        let pps = [0x68, 0xee, 0x3c, 0x80];
        let record = build_avc_decoder_record(&sps, &pps).unwrap();

        assert_eq!(&record[..6], &[1, 0x64, 0x00, 0x1f, 0xFF, 0xE1]);
        assert_eq!(&record[6..8], &[0, 5]);
        assert_eq!(&record[8..13], &sps);
        assert_eq!(record[13], 1);
        assert_eq!(&record[14..16], &[0, 4]);
        assert_eq!(&record[16..], &pps);
        assert_eq!(profile_level_id(&sps), "64001f");
    }

    #[test]
    fn test_avc_decoder_record_accepts_short_sps() {
        let record = build_avc_decoder_record(&[0x67, 0x01, 0x02], &[0x68, 0x03, 0x04]).unwrap();
        assert_eq!(&record[1..4], &[0x01, 0x02, 0x00]);
        assert_eq!(profile_level_id(&[0x67, 0x01, 0x02]), "010200");
    }

    #[test]
    fn test_avc_decoder_record_rejects_wrong_types() {
        assert!(build_avc_decoder_record(&[0x68, 1], &[0x68, 1]).is_err());
        assert!(build_avc_decoder_record(&[0x67, 1], &[0x65, 1]).is_err());
        assert!(build_avc_decoder_record(&[], &[0x68]).is_err());
    }

    #[test]
    fn test_emulation_prevention() {
        let raw = [0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x03, 0xFF];
        let escaped = add_emulation_prevention(&raw);
        assert_eq!(
            escaped,
            vec![0x00, 0x00, 0x03, 0x01, 0x00, 0x00, 0x03, 0x00, 0x00, 0x03, 0x03, 0xFF]
        );
        assert!(split_annex_b(&Bytes::from(escaped.clone())).is_empty());
        assert_eq!(remove_emulation_prevention(&escaped), raw.to_vec());

        let plain = [0x41, 0x00, 0x05, 0x00];
        assert_eq!(add_emulation_prevention(&plain), plain.to_vec());
    }
}
