//! The 4-byte packet header that precedes every framed payload on the wire.
//!
//! Layout (big-endian): `{flags: u8, payload_size: u24}`. `flags` packs a
//! 3-bit [`PacketType`] in bits 0-2 and a 2-bit [`Compression`] in bits 3-4;
//! the remaining bits are reserved and must be zero on encode, ignored on
//! decode.

use crate::errors::CodecError;

/// Size in bytes of an encoded [`PacketHeader`].
pub const PACKET_HEADER_SIZE: usize = 4;

/// On-wire payload size cap (after compression, if any).
pub const MAX_WIRE_PAYLOAD: u32 = 1024 * 1024;

/// Pre-compression payload size cap.
pub const MAX_UNCOMPRESSED_PAYLOAD: u32 = 5 * 1024 * 1024;

/// Payloads at or above this size are eligible for deflate compression.
pub const COMPRESSION_THRESHOLD: usize = 10 * 1024;

const TYPE_MASK: u8 = 0b0000_0111;
const COMPRESSION_MASK: u8 = 0b0001_1000;
const COMPRESSION_SHIFT: u8 = 3;

/// The kind of payload framed by a [`PacketHeader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// No payload; reserved.
    None = 0,
    /// An application payload message.
    Message = 1,
    /// A keep-alive/latency probe sent to the peer.
    Ping = 2,
    /// A reply to a [`PacketType::Ping`].
    PingResponse = 3,
    /// An internal health-check probe (no application visibility).
    HealthCheck = 4,
}

impl PacketType {
    fn from_bits(bits: u8) -> Result<Self, CodecError> {
        match bits {
            0 => Ok(Self::None),
            1 => Ok(Self::Message),
            2 => Ok(Self::Ping),
            3 => Ok(Self::PingResponse),
            4 => Ok(Self::HealthCheck),
            other => Err(CodecError::InvalidPacketType { bits: other }),
        }
    }
}

/// Wire-level compression applied to a packet's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// Payload is stored as-is.
    None = 0,
    /// Payload is deflate-compressed (RFC 1951).
    Deflate = 1,
}

impl Compression {
    fn from_bits(bits: u8) -> Result<Self, CodecError> {
        match bits {
            0 => Ok(Self::None),
            1 => Ok(Self::Deflate),
            other => Err(CodecError::InvalidCompression { bits: other }),
        }
    }
}

/// A decoded packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Kind of payload this header frames.
    pub kind: PacketType,
    /// Compression applied to the payload.
    pub compression: Compression,
    /// Size of the payload as it appears on the wire (post-compression).
    pub payload_size: u32,
}

impl PacketHeader {
    /// Compose the 4-byte wire representation.
    #[must_use]
    pub fn encode(kind: PacketType, compression: Compression, payload_size: u32) -> [u8; 4] {
        let flags = (kind as u8) | ((compression as u8) << COMPRESSION_SHIFT);
        let size = payload_size.to_be_bytes();
        [flags, size[1], size[2], size[3]]
    }

    /// Parse a 4-byte wire header.
    ///
    /// When `enforce_limit` is set, rejects `payload_size > MAX_WIRE_PAYLOAD`
    /// with [`CodecError::WireMessageTooLarge`]. The read path (see
    /// `ReadBuffer::try_read_next`) intentionally does not enforce the limit
    /// here so that an oversized-but-complete frame can still be classified
    /// precisely once fully buffered.
    pub fn decode(buf: &[u8; 4], enforce_limit: bool) -> Result<Self, CodecError> {
        let flags = buf[0];
        let kind = PacketType::from_bits(flags & TYPE_MASK)?;
        let compression = Compression::from_bits((flags & COMPRESSION_MASK) >> COMPRESSION_SHIFT)?;
        let payload_size = u32::from_be_bytes([0, buf[1], buf[2], buf[3]]);

        if enforce_limit && payload_size > MAX_WIRE_PAYLOAD {
            return Err(CodecError::WireMessageTooLarge {
                size: payload_size,
                max: MAX_WIRE_PAYLOAD,
            });
        }

        Ok(Self { kind, compression, payload_size })
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn any_packet_type() -> impl Strategy<Value = PacketType> {
        prop_oneof![
            Just(PacketType::None),
            Just(PacketType::Message),
            Just(PacketType::Ping),
            Just(PacketType::PingResponse),
            Just(PacketType::HealthCheck),
        ]
    }

    fn any_compression() -> impl Strategy<Value = Compression> {
        prop_oneof![Just(Compression::None), Just(Compression::Deflate)]
    }

    proptest! {
        #[test]
        fn header_round_trip(
            kind in any_packet_type(),
            compression in any_compression(),
            payload_size in 0u32..=MAX_WIRE_PAYLOAD,
        ) {
            let wire = PacketHeader::encode(kind, compression, payload_size);
            let decoded = PacketHeader::decode(&wire, true).expect("should decode");
            prop_assert_eq!(decoded.kind, kind);
            prop_assert_eq!(decoded.compression, compression);
            prop_assert_eq!(decoded.payload_size, payload_size);
        }
    }

    #[test]
    fn exactly_one_mib_on_wire_succeeds() {
        let wire = PacketHeader::encode(PacketType::Message, Compression::None, MAX_WIRE_PAYLOAD);
        assert!(PacketHeader::decode(&wire, true).is_ok());
    }

    #[test]
    fn one_mib_plus_one_fails() {
        let wire =
            PacketHeader::encode(PacketType::Message, Compression::None, MAX_WIRE_PAYLOAD + 1);
        let err = PacketHeader::decode(&wire, true).unwrap_err();
        assert!(matches!(err, CodecError::WireMessageTooLarge { .. }));
    }

    #[test]
    fn unenforced_decode_allows_oversized_size_field() {
        let wire =
            PacketHeader::encode(PacketType::Message, Compression::None, MAX_WIRE_PAYLOAD + 1);
        assert!(PacketHeader::decode(&wire, false).is_ok());
    }

    #[test]
    fn reject_invalid_packet_type() {
        let wire = [0b0000_0111, 0, 0, 0];
        let err = PacketHeader::decode(&wire, false).unwrap_err();
        assert!(matches!(err, CodecError::InvalidPacketType { bits: 7 }));
    }
}
