//! Wire-level codec for the Starlane client network core.
//!
//! Defines the two fixed binary headers exchanged with a game backend (the
//! per-packet [`PacketHeader`] and the per-connection [`ProtocolHeader`]) and
//! the encode/decode functions that compose them with a payload, including
//! optional deflate compression above a size threshold.
//!
//! This crate is pure and synchronous: it knows nothing about sockets,
//! buffering, or timing. [`starlane_net`](https://docs.rs/starlane-net) builds
//! the I/O pump on top of it.

pub mod codec;
pub mod errors;
pub mod packet_header;
pub mod protocol_header;

pub use codec::{decode_payload, encode_frame};
pub use errors::CodecError;
pub use packet_header::{
    COMPRESSION_THRESHOLD, Compression, MAX_UNCOMPRESSED_PAYLOAD, MAX_WIRE_PAYLOAD,
    PACKET_HEADER_SIZE, PacketHeader, PacketType,
};
pub use protocol_header::{
    ClusterStatus, MAX_WIRE_VERSION, MIN_WIRE_VERSION, PROTOCOL_HEADER_SIZE, ProtocolHeader,
    parse_protocol_header,
};
