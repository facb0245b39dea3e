//! Fuzz target for `starlane_proto::decode_payload`.
//!
//! Constructs a header deterministically (every `PacketType` x every
//! `Compression`) and throws arbitrary bytes at it as the wire payload, the
//! way a corrupt or adversarial deflate stream would arrive on the wire.
//! Decompression failure must come back as `CodecError::DecompressionFailed`,
//! never panic or over-read.

#![no_main]

use libfuzzer_sys::fuzz_target;
use starlane_proto::{Compression, PacketHeader, PacketType, decode_payload};

fuzz_target!(|payload: Vec<u8>| {
    let kinds = [
        PacketType::None,
        PacketType::Message,
        PacketType::Ping,
        PacketType::PingResponse,
        PacketType::HealthCheck,
    ];
    let compressions = [Compression::None, Compression::Deflate];

    for kind in kinds {
        for compression in compressions {
            let size = u32::try_from(payload.len()).unwrap_or(u32::MAX);
            let header = PacketHeader { kind, compression, payload_size: size };
            let _ = decode_payload(&header, &payload);
        }
    }
});
