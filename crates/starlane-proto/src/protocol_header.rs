//! The 8-byte protocol header sent as the first bytes of a new connection,
//! ahead of any framed packet.
//!
//! Layout (big-endian): `{magic: [u8; 4], wire_version: u8, status: u8,
//! reserved: [u8; 2]}`. Validation order is cheapest-first: magic, then
//! version, then the server's status byte is handed back uninterpreted for
//! the handshake state machine to act on.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::errors::CodecError;

/// The lowest wire version this codec understands.
pub const MIN_WIRE_VERSION: u8 = 1;

/// The highest (and, currently, only) wire version this codec understands.
pub const MAX_WIRE_VERSION: u8 = 1;

/// Server cluster status carried in the protocol header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterStatus {
    /// Status not yet determined.
    Pending,
    /// The 4-byte magic did not match what this client expected.
    InvalidGameMagic,
    /// The server's wire version is outside this client's supported range.
    WireProtocolVersionMismatch,
    /// The cluster is accepting connections; the handshake may proceed.
    ClusterRunning,
    /// The cluster is starting up and not yet accepting connections.
    ClusterStarting,
    /// The cluster is shutting down and rejecting new connections.
    ClusterShuttingDown,
    /// Deprecated maintenance-mode status, retained for wire compatibility.
    InMaintenance,
    /// A status byte this client does not recognize.
    Unknown(u8),
}

impl ClusterStatus {
    fn from_byte(byte: u8) -> Self {
        match byte {
            0 => Self::Pending,
            1 => Self::InvalidGameMagic,
            2 => Self::WireProtocolVersionMismatch,
            3 => Self::ClusterRunning,
            4 => Self::ClusterStarting,
            5 => Self::ClusterShuttingDown,
            6 => Self::InMaintenance,
            other => Self::Unknown(other),
        }
    }

    /// Whether the handshake may proceed past the protocol header in this status.
    #[must_use]
    pub fn permits_handshake(self) -> bool {
        matches!(self, Self::ClusterRunning)
    }
}

#[repr(C, packed)]
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct ProtocolHeaderBytes {
    magic: [u8; 4],
    wire_version: u8,
    status: u8,
    reserved: [u8; 2],
}

/// Size in bytes of the on-wire protocol header.
pub const PROTOCOL_HEADER_SIZE: usize = core::mem::size_of::<ProtocolHeaderBytes>();

/// Result of parsing the server's protocol header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolHeader {
    /// Wire version advertised by the server.
    pub wire_version: u8,
    /// Cluster status advertised by the server.
    pub status: ClusterStatus,
}

/// Parse the 8-byte protocol header, validating magic then version before
/// returning the server's status.
///
/// # Errors
///
/// Returns [`CodecError::InvalidGameMagic`] if `buf`'s first 4 bytes do not
/// match `expected_magic`, or [`CodecError::WireProtocolVersionMismatch`] if
/// the version byte falls outside `[MIN_WIRE_VERSION..=MAX_WIRE_VERSION]`.
pub fn parse_protocol_header(
    buf: &[u8; PROTOCOL_HEADER_SIZE],
    expected_magic: [u8; 4],
) -> Result<ProtocolHeader, CodecError> {
    // INVARIANT: `buf` is exactly PROTOCOL_HEADER_SIZE bytes (the parameter's
    // own array type), which is `ProtocolHeaderBytes`'s exact zerocopy size.
    #[allow(clippy::expect_used)]
    let raw =
        ProtocolHeaderBytes::ref_from_bytes(buf.as_slice()).expect("fixed-size array always fits");

    if raw.magic != expected_magic {
        return Err(CodecError::InvalidGameMagic { received: raw.magic });
    }

    if !(MIN_WIRE_VERSION..=MAX_WIRE_VERSION).contains(&raw.wire_version) {
        return Err(CodecError::WireProtocolVersionMismatch { server_version: raw.wire_version });
    }

    Ok(ProtocolHeader { wire_version: raw.wire_version, status: ClusterStatus::from_byte(raw.status) })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(magic: [u8; 4], version: u8, status: u8) -> [u8; PROTOCOL_HEADER_SIZE] {
        [magic[0], magic[1], magic[2], magic[3], version, status, 0, 0]
    }

    #[test]
    fn valid_header_with_cluster_running_parses() {
        let buf = wire(*b"STAR", 1, 3);
        let header = parse_protocol_header(&buf, *b"STAR").expect("should parse");
        assert_eq!(header.wire_version, 1);
        assert_eq!(header.status, ClusterStatus::ClusterRunning);
        assert!(header.status.permits_handshake());
    }

    #[test]
    fn magic_mismatch_is_checked_before_version() {
        let buf = wire(*b"ABCD", 99, 5);
        let err = parse_protocol_header(&buf, *b"STAR").unwrap_err();
        assert!(matches!(err, CodecError::InvalidGameMagic { received } if received == *b"ABCD"));
    }

    #[test]
    fn version_mismatch_after_magic_ok() {
        let buf = wire(*b"STAR", 99, 3);
        let err = parse_protocol_header(&buf, *b"STAR").unwrap_err();
        assert!(matches!(err, CodecError::WireProtocolVersionMismatch { server_version: 99 }));
    }

    #[test]
    fn only_cluster_running_permits_handshake() {
        let buf = wire(*b"STAR", 1, 5);
        let header = parse_protocol_header(&buf, *b"STAR").expect("should parse");
        assert_eq!(header.status, ClusterStatus::ClusterShuttingDown);
        assert!(!header.status.permits_handshake());
    }
}
