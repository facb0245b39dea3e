//! Fuzz target for `PacketHeader`/`ProtocolHeader` boundary conditions.
//!
//! Exercises the 4-byte packet header and 8-byte protocol header parsers
//! against the edges of their value ranges: invalid type/compression bits,
//! the wire-size cap exactly at and just past `MAX_WIRE_PAYLOAD`, magic
//! mismatches, and out-of-range wire versions. Neither parser may panic;
//! every malformed input must come back as a `CodecError`.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use starlane_proto::{MAX_WIRE_PAYLOAD, PacketHeader, parse_protocol_header};

const GAME_MAGIC: [u8; 4] = *b"STAR";

#[derive(Debug, Clone, Arbitrary)]
struct BoundaryInput {
    flags: u8,
    payload_size: SizeChoice,
    magic: MagicChoice,
    wire_version: VersionChoice,
    status: u8,
}

#[derive(Debug, Clone, Arbitrary)]
enum SizeChoice {
    Zero,
    AtMax,
    JustOverMax,
    WayOverMax,
    Random(u32),
}

#[derive(Debug, Clone, Arbitrary)]
enum MagicChoice {
    Valid,
    OffByOne(u8),
    Random([u8; 4]),
}

#[derive(Debug, Clone, Arbitrary)]
enum VersionChoice {
    Valid,
    Zero,
    Max,
    Random(u8),
}

fuzz_target!(|input: BoundaryInput| {
    let payload_size = match input.payload_size {
        SizeChoice::Zero => 0,
        SizeChoice::AtMax => MAX_WIRE_PAYLOAD,
        SizeChoice::JustOverMax => MAX_WIRE_PAYLOAD.saturating_add(1),
        SizeChoice::WayOverMax => MAX_WIRE_PAYLOAD.saturating_add(1_000_000),
        SizeChoice::Random(r) => r,
    };

    let size_bytes = payload_size.to_be_bytes();
    let wire = [input.flags, size_bytes[1], size_bytes[2], size_bytes[3]];

    match PacketHeader::decode(&wire, true) {
        Ok(header) => assert!(header.payload_size <= MAX_WIRE_PAYLOAD),
        Err(_) => {}
    }
    // Unenforced decode must never reject solely on size, only on bad bits.
    let _ = PacketHeader::decode(&wire, false);

    let magic = match input.magic {
        MagicChoice::Valid => GAME_MAGIC,
        MagicChoice::OffByOne(offset) => {
            let mut m = GAME_MAGIC;
            let idx = (offset % 4) as usize;
            m[idx] = m[idx].wrapping_add(1);
            m
        }
        MagicChoice::Random(bytes) => bytes,
    };

    let wire_version = match input.wire_version {
        VersionChoice::Valid => 1,
        VersionChoice::Zero => 0,
        VersionChoice::Max => u8::MAX,
        VersionChoice::Random(v) => v,
    };

    let protocol_header = [magic[0], magic[1], magic[2], magic[3], wire_version, input.status, 0, 0];
    let _ = parse_protocol_header(&protocol_header, GAME_MAGIC);
});
