//! Best-effort "this attempt is no longer wanted" notification, sent on a
//! socket that only finished connecting (or authenticating) after its result
//! stopped mattering (§4.6, §4.7, §9).
//!
//! The happy-eyeballs race and the TLS cancel-after-auth race both let the
//! loser keep running in the background rather than aborting it outright,
//! since a half-open TCP connect can't be cancelled cleanly once the kernel
//! has committed to it. If that background attempt later succeeds anyway,
//! the peer has accepted a connection nobody will ever use; this sends one
//! short framed message so it can account for that rather than just timing
//! the socket out.

use std::time::Duration;

use starlane_proto::{CodecError, PacketType, encode_frame};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Which race the abandoned attempt lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbandonSource {
    /// Lost the happy-eyeballs v4/v6 race (§4.6).
    Dialer,
    /// Won the TCP race but lost a cancel-after-auth-completes race (§4.7).
    TlsAttach,
}

impl AbandonSource {
    fn tag(self) -> u8 {
        match self {
            Self::Dialer => 0,
            Self::TlsAttach => 1,
        }
    }
}

/// Build the abandon payload: `{source: u8, connection_started_at_ms: u64,
/// abandoned_at_ms: u64}`, both timestamps relative to when the happy-eyeballs
/// race as a whole began.
fn encode_payload(source: AbandonSource, connection_started_at: Duration, abandoned_at: Duration) -> Vec<u8> {
    let mut payload = Vec::with_capacity(17);
    payload.push(source.tag());
    payload.extend_from_slice(&u64::try_from(connection_started_at.as_millis()).unwrap_or(u64::MAX).to_be_bytes());
    payload.extend_from_slice(&u64::try_from(abandoned_at.as_millis()).unwrap_or(u64::MAX).to_be_bytes());
    payload
}

/// Write the framed abandon message, then shut the stream down. Best-effort:
/// any I/O failure here is swallowed, since by construction nobody is left
/// waiting on this socket.
pub async fn send_and_close<S>(
    mut stream: S,
    source: AbandonSource,
    connection_started_at: Duration,
    abandoned_at: Duration,
) where
    S: AsyncWrite + Unpin,
{
    if let Ok(frame) = build_frame(source, connection_started_at, abandoned_at) {
        let _ = stream.write_all(&frame).await;
    }
    let _ = stream.shutdown().await;
}

fn build_frame(
    source: AbandonSource,
    connection_started_at: Duration,
    abandoned_at: Duration,
) -> Result<Vec<u8>, CodecError> {
    encode_frame(PacketType::Message, &encode_payload(source, connection_started_at, abandoned_at), false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_carries_source_and_both_timestamps() {
        let payload = encode_payload(AbandonSource::TlsAttach, Duration::from_millis(10), Duration::from_millis(300));
        assert_eq!(payload[0], 1);
        assert_eq!(u64::from_be_bytes(payload[1..9].try_into().unwrap()), 10);
        assert_eq!(u64::from_be_bytes(payload[9..17].try_into().unwrap()), 300);
    }

    #[tokio::test]
    async fn send_and_close_writes_a_well_formed_frame_then_shuts_down() {
        let (mut probe, stream) = tokio::io::duplex(256);
        send_and_close(stream, AbandonSource::Dialer, Duration::ZERO, Duration::from_millis(5)).await;

        use tokio::io::AsyncReadExt;
        let mut wire = Vec::new();
        probe.read_to_end(&mut wire).await.unwrap();

        let header = starlane_proto::PacketHeader::decode(&wire[..starlane_proto::PACKET_HEADER_SIZE].try_into().unwrap(), true).unwrap();
        assert_eq!(header.kind, PacketType::Message);
        assert_eq!(header.payload_size as usize, wire.len() - starlane_proto::PACKET_HEADER_SIZE);
    }
}
