//! Packet-level encode/decode: composes a [`PacketHeader`] with a payload,
//! applying the compression threshold and size caps described in the data
//! model.

use std::io::{Read, Write};

use flate2::{Compression as DeflateLevel, read::DeflateDecoder, write::DeflateEncoder};

use crate::{
    errors::CodecError,
    packet_header::{
        COMPRESSION_THRESHOLD, Compression, MAX_UNCOMPRESSED_PAYLOAD, MAX_WIRE_PAYLOAD,
        PacketHeader, PacketType,
    },
};

/// Encode a full wire frame: `{PacketHeader}{payload}`.
///
/// When `compression_enabled` and `payload.len() >= COMPRESSION_THRESHOLD`,
/// the payload is deflated and the on-wire size reflects the compressed
/// length; the uncompressed size cap is still enforced against the
/// pre-compression buffer, and the on-wire cap against the post-compression
/// buffer.
///
/// # Errors
///
/// Returns [`CodecError::UncompressedMessageTooLarge`] or
/// [`CodecError::WireMessageTooLarge`] if either cap is exceeded.
pub fn encode_frame(
    kind: PacketType,
    payload: &[u8],
    compression_enabled: bool,
) -> Result<Vec<u8>, CodecError> {
    if payload.len() > MAX_UNCOMPRESSED_PAYLOAD as usize {
        return Err(CodecError::UncompressedMessageTooLarge {
            size: payload.len(),
            max: MAX_UNCOMPRESSED_PAYLOAD,
        });
    }

    let should_compress = compression_enabled && payload.len() >= COMPRESSION_THRESHOLD;

    let (compression, wire_payload) = if should_compress {
        (Compression::Deflate, deflate(payload))
    } else {
        (Compression::None, payload.to_vec())
    };

    let wire_size = u32::try_from(wire_payload.len()).unwrap_or(u32::MAX);
    if wire_size > MAX_WIRE_PAYLOAD {
        return Err(CodecError::WireMessageTooLarge { size: wire_size, max: MAX_WIRE_PAYLOAD });
    }

    let header = PacketHeader::encode(kind, compression, wire_size);
    let mut out = Vec::with_capacity(header.len() + wire_payload.len());
    out.extend_from_slice(&header);
    out.extend_from_slice(&wire_payload);
    Ok(out)
}

/// Recover the logical payload bytes from a decoded header and its on-wire
/// payload bytes, eagerly decompressing when `header.compression` is
/// [`Compression::Deflate`].
pub fn decode_payload(header: &PacketHeader, wire_payload: &[u8]) -> Result<Vec<u8>, CodecError> {
    match header.compression {
        Compression::None => Ok(wire_payload.to_vec()),
        Compression::Deflate => inflate(wire_payload),
    }
}

fn deflate(data: &[u8]) -> Vec<u8> {
    let mut encoder = DeflateEncoder::new(Vec::new(), DeflateLevel::default());
    // INVARIANT: writing to and finishing an in-memory Vec<u8> sink never
    // returns Err; only a real I/O-backed Write can fail here.
    #[allow(clippy::expect_used)]
    {
        encoder.write_all(data).expect("in-memory deflate write cannot fail");
        encoder.finish().expect("in-memory deflate finish cannot fail")
    }
}

fn inflate(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut decoder = DeflateDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| CodecError::DecompressionFailed { reason: e.to_string() })?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::packet_header::{PACKET_HEADER_SIZE, PacketHeader};

    proptest! {
        #[test]
        fn frame_round_trip_uncompressed(payload in proptest::collection::vec(any::<u8>(), 0..4096)) {
            let wire = encode_frame(PacketType::Message, &payload, false).expect("encode");
            let mut header_bytes = [0u8; PACKET_HEADER_SIZE];
            header_bytes.copy_from_slice(&wire[..PACKET_HEADER_SIZE]);
            let header = PacketHeader::decode(&header_bytes, true).expect("header decode");
            let decoded = decode_payload(&header, &wire[PACKET_HEADER_SIZE..]).expect("payload decode");
            prop_assert_eq!(decoded, payload);
        }
    }

    #[test]
    fn small_payload_is_never_compressed() {
        let payload = vec![0x42u8; COMPRESSION_THRESHOLD - 1];
        let wire = encode_frame(PacketType::Message, &payload, true).expect("encode");
        assert_eq!(wire[0] & 0b0001_1000, 0, "compression bits must be unset below threshold");
    }

    #[test]
    fn threshold_payload_is_compressed_when_enabled() {
        let payload = vec![0x42u8; COMPRESSION_THRESHOLD];
        let wire = encode_frame(PacketType::Message, &payload, true).expect("encode");
        assert_ne!(wire[0] & 0b0001_1000, 0, "compression bits must be set at threshold");
    }

    #[test]
    fn oversized_uncompressed_payload_is_rejected() {
        let payload = vec![0u8; MAX_UNCOMPRESSED_PAYLOAD as usize + 1];
        let err = encode_frame(PacketType::Message, &payload, false).unwrap_err();
        assert!(matches!(err, CodecError::UncompressedMessageTooLarge { .. }));
    }

    #[test]
    fn round_trip_through_compression() {
        let payload: Vec<u8> = (0..COMPRESSION_THRESHOLD as u32 + 500).map(|i| (i % 251) as u8).collect();
        let wire = encode_frame(PacketType::Message, &payload, true).expect("encode");
        let mut header_bytes = [0u8; PACKET_HEADER_SIZE];
        header_bytes.copy_from_slice(&wire[..PACKET_HEADER_SIZE]);
        let header = PacketHeader::decode(&header_bytes, true).expect("header decode");
        assert_eq!(header.compression, Compression::Deflate);
        let decoded = decode_payload(&header, &wire[PACKET_HEADER_SIZE..]).expect("payload decode");
        assert_eq!(decoded, payload);
    }
}
