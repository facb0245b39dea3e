//! Error types for packet and protocol header parsing and frame codec
//! operations.

use thiserror::Error;

/// Errors that can occur while encoding or decoding wire frames.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Packet header flags named a packet type this codec does not know.
    #[error("invalid packet type bits: {bits:#05b}")]
    InvalidPacketType {
        /// The raw 3-bit field that failed to parse.
        bits: u8,
    },

    /// Packet header flags named a compression scheme this codec does not know.
    #[error("invalid compression bits: {bits:#04b}")]
    InvalidCompression {
        /// The raw 2-bit field that failed to parse.
        bits: u8,
    },

    /// On-wire payload size exceeds [`crate::packet_header::MAX_WIRE_PAYLOAD`].
    #[error("wire message too large: {size} bytes (max {max})")]
    WireMessageTooLarge {
        /// The size that was rejected.
        size: u32,
        /// The configured maximum.
        max: u32,
    },

    /// Pre-compression payload exceeds
    /// [`crate::packet_header::MAX_UNCOMPRESSED_PAYLOAD`].
    #[error("uncompressed message too large: {size} bytes (max {max})")]
    UncompressedMessageTooLarge {
        /// The size that was rejected.
        size: usize,
        /// The configured maximum.
        max: u32,
    },

    /// The server's 4-byte magic did not match this client's configured magic.
    #[error("invalid game magic: received {received:?}")]
    InvalidGameMagic {
        /// The magic bytes actually received.
        received: [u8; 4],
    },

    /// The server's wire version falls outside the supported range.
    #[error("unsupported wire protocol version: {server_version}")]
    WireProtocolVersionMismatch {
        /// The version byte the server advertised.
        server_version: u8,
    },

    /// Deflate decompression of a packet payload failed.
    #[error("deflate decompression failed: {reason}")]
    DecompressionFailed {
        /// Description of the underlying failure.
        reason: String,
    },

    /// A frame claimed a packet type this codec does not carry a payload
    /// interpretation for.
    #[error("unknown packet type on read path: {0:?}")]
    UnknownPacketType(u8),
}
