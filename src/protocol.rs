//! Wire protocol: packet header layout, packet/config type tags, and the
//! pure encode/decode functions used by the demuxer.

use byteorder::{BigEndian, ByteOrder};

/// Header is 1 byte type + 4 byte big-endian length.
pub const HEADER_LEN: usize = 5;

/// Payload bytes may not exceed this; a header claiming more is invalid.
pub const MAX_PAYLOAD: usize = 65536;

/// Tagged packet kind, matching the on-wire byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Video,
    Audio,
    Config,
    Heartbeat,
    AuthChallenge,
    AuthResponse,
    AuthSuccess,
    AuthFail,
}

impl PacketType {
    pub fn code(self) -> u8 {
        match self {
            PacketType::Video => 0x01,
            PacketType::Audio => 0x02,
            PacketType::Config => 0x03,
            PacketType::Heartbeat => 0x04,
            PacketType::AuthChallenge => 0x10,
            PacketType::AuthResponse => 0x11,
            PacketType::AuthSuccess => 0x12,
            PacketType::AuthFail => 0x13,
        }
    }

    pub fn from_code(code: u8) -> Option<PacketType> {
        Some(match code {
            0x01 => PacketType::Video,
            0x02 => PacketType::Audio,
            0x03 => PacketType::Config,
            0x04 => PacketType::Heartbeat,
            0x10 => PacketType::AuthChallenge,
            0x11 => PacketType::AuthResponse,
            0x12 => PacketType::AuthSuccess,
            0x13 => PacketType::AuthFail,
            _ => return None,
        })
    }
}

/// First payload byte of a `Config` packet. Unrecognized values pass through
/// as opaque and are still forwarded to the config callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSubtype {
    VideoSps,
    VideoPps,
    AudioAac,
    Other(u8),
}

impl ConfigSubtype {
    pub fn from_byte(b: u8) -> ConfigSubtype {
        match b {
            0x01 => ConfigSubtype::VideoSps,
            0x02 => ConfigSubtype::VideoPps,
            0x03 => ConfigSubtype::AudioAac,
            other => ConfigSubtype::Other(other),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            ConfigSubtype::VideoSps => 0x01,
            ConfigSubtype::VideoPps => 0x02,
            ConfigSubtype::AudioAac => 0x03,
            ConfigSubtype::Other(b) => b,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub kind: PacketType,
    pub length: u32,
}

/// A fully reassembled packet: tag plus its payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketType,
    pub payload: Vec<u8>,
}

/// Encode a 5-byte header. `length` must be `<= MAX_PAYLOAD`; the caller
/// guarantees this, matching the precondition in the spec.
pub fn encode_header(kind: PacketType, length: u32) -> [u8; HEADER_LEN] {
    debug_assert!(length as usize <= MAX_PAYLOAD);
    let mut buf = [0u8; HEADER_LEN];
    buf[0] = kind.code();
    BigEndian::write_u32(&mut buf[1..5], length);
    buf
}

/// Decode a header from the first `HEADER_LEN` bytes of `data`. Returns
/// `None` if there aren't enough bytes, the type byte is unrecognized, or
/// the length exceeds `MAX_PAYLOAD` — all of which the caller treats as
/// "invalid, resync by one byte".
pub fn decode_header(data: &[u8]) -> Option<PacketHeader> {
    if data.len() < HEADER_LEN {
        return None;
    }
    let kind = PacketType::from_code(data[0])?;
    let length = BigEndian::read_u32(&data[1..5]);
    if length as usize > MAX_PAYLOAD {
        return None;
    }
    Some(PacketHeader { kind, length })
}

/// Encode a full packet (header + payload) for writing to the transport.
pub fn encode_packet(kind: PacketType, payload: &[u8]) -> Vec<u8> {
    debug_assert!(payload.len() <= MAX_PAYLOAD);
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&encode_header(kind, payload.len() as u32));
    out.extend_from_slice(payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip_video_1024() {
        let header = encode_header(PacketType::Video, 1024);
        assert_eq!(header, [0x01, 0x00, 0x00, 0x04, 0x00]);
        let decoded = decode_header(&header).unwrap();
        assert_eq!(decoded.kind, PacketType::Video);
        assert_eq!(decoded.length, 1024);
    }

    #[test]
    fn header_round_trip_all_known_types() {
        for kind in [
            PacketType::Video,
            PacketType::Audio,
            PacketType::Config,
            PacketType::Heartbeat,
            PacketType::AuthChallenge,
            PacketType::AuthResponse,
            PacketType::AuthSuccess,
            PacketType::AuthFail,
        ] {
            for length in [0u32, 1, 65535, MAX_PAYLOAD as u32] {
                let header = encode_header(kind, length);
                let decoded = decode_header(&header).unwrap();
                assert_eq!(decoded.kind, kind);
                assert_eq!(decoded.length, length);
            }
        }
    }

    #[test]
    fn unknown_type_byte_is_invalid() {
        let bytes = [0x99, 0x00, 0x00, 0x00, 0x00];
        assert!(decode_header(&bytes).is_none());
    }

    #[test]
    fn oversize_length_is_invalid() {
        // length = 0xFFFFFFFF
        let bytes = [0x01, 0xFF, 0xFF, 0xFF, 0xFF];
        assert!(decode_header(&bytes).is_none());
    }

    #[test]
    fn too_short_is_invalid() {
        assert!(decode_header(&[0x01, 0x00, 0x00]).is_none());
        assert!(decode_header(&[]).is_none());
    }

    #[test]
    fn length_exactly_at_ceiling_is_valid() {
        let bytes = encode_header(PacketType::Video, MAX_PAYLOAD as u32);
        assert!(decode_header(&bytes).is_some());
    }

    #[test]
    fn length_one_over_ceiling_is_invalid() {
        let mut bytes = encode_header(PacketType::Video, MAX_PAYLOAD as u32);
        // bump length by 1 -> MAX_PAYLOAD + 1
        BigEndian::write_u32(&mut bytes[1..5], MAX_PAYLOAD as u32 + 1);
        assert!(decode_header(&bytes).is_none());
    }

    #[test]
    fn config_subtype_round_trip() {
        assert_eq!(ConfigSubtype::from_byte(0x01), ConfigSubtype::VideoSps);
        assert_eq!(ConfigSubtype::from_byte(0x02), ConfigSubtype::VideoPps);
        assert_eq!(ConfigSubtype::from_byte(0x03), ConfigSubtype::AudioAac);
        assert_eq!(ConfigSubtype::from_byte(0x7f), ConfigSubtype::Other(0x7f));
        assert_eq!(ConfigSubtype::VideoSps.to_byte(), 0x01);
        assert_eq!(ConfigSubtype::Other(0x7f).to_byte(), 0x7f);
    }
}
