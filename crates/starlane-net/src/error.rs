//! Error taxonomy for the async I/O layer: dialing, TLS attach, and the
//! steady-state stream transport pump (§7).
//!
//! [`starlane_core`]'s `ConnectionError` and `SessionError` are Sans-IO and
//! never see a socket; this crate's errors wrap `std::io::Error` at the
//! actual I/O boundaries and classify failures the way the pump and the
//! connection orchestrator need to react to them.

use std::{io, time::Duration};

use starlane_proto::{ClusterStatus, CodecError};
use thiserror::Error;

/// Errors from [`crate::dialer::TcpDialer::open`]'s happy-eyeballs race (§4.6).
#[derive(Error, Debug)]
pub enum DialError {
    /// At least one attempt was refused by the peer (`ECONNREFUSED`); this is
    /// reported in preference to a generic failure when both families fail.
    #[error("connection refused")]
    ConnectionRefused,

    /// Neither family produced a successful connection and none was refused.
    #[error("could not connect")]
    CouldNotConnect,

    /// No addresses were available for the configured families.
    #[error("no addresses available to dial")]
    NoAddresses,
}

/// Errors from [`crate::tls::attach`] (§4.7).
#[derive(Error, Debug)]
pub enum TlsAttachError {
    /// The handshake was cancelled or closed before authentication completed.
    #[error("tls handshake did not complete authentication")]
    NotAuthenticated,

    /// The handshake itself failed.
    #[error("tls handshake failed: {0}")]
    FailureWhileAuthenticating(String),

    /// The resulting stream is not encrypted (should not occur with this
    /// crate's rustls-backed implementation; retained for parity with the
    /// abstract error taxonomy).
    #[error("stream is not encrypted")]
    NotEncrypted,
}

/// Errors from the steady-state [`crate::transport::StreamTransport`] pump and
/// its handshake sub-protocol (§4.8, §7).
#[derive(Error, Debug)]
pub enum TransportError {
    /// The initial TCP+TLS connect did not complete within `CONNECT_TIMEOUT`.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// The 8-byte protocol header was not read within `HEADER_READ_TIMEOUT`.
    #[error("protocol header read timed out after {0:?}")]
    HeaderTimeout(Duration),

    /// An in-flight read did not complete within `READ_TIMEOUT`.
    #[error("read timed out after {0:?}")]
    ReadTimeout(Duration),

    /// An in-flight write did not complete within `WRITE_TIMEOUT`.
    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),

    /// The peer closed the stream.
    #[error("stream closed by peer")]
    StreamClosed,

    /// A read or write syscall failed.
    #[error("stream I/O failed during {op}: {source}")]
    StreamIoFailed {
        /// Which operation failed (`"read"` or `"write"`), for diagnostics.
        op: &'static str,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Dialing failed (§4.6).
    #[error("dial failed: {0}")]
    Dial(#[from] DialError),

    /// TLS attach failed (§4.7).
    #[error("tls attach failed: {0}")]
    Tls(#[from] TlsAttachError),

    /// A wire-level codec failure: framing, magic, version, or size caps.
    #[error("wire format error: {0}")]
    WireFormat(#[from] CodecError),

    /// The server's protocol header reported a status that does not permit
    /// the handshake to proceed.
    #[error("server rejected connection: {status:?}")]
    ProtocolStatus {
        /// The disqualifying status the server reported.
        status: ClusterStatus,
    },

    /// The handshake's byte exchange completed but did not contain a valid
    /// `ServerHello`.
    #[error("missing or malformed ServerHello during handshake")]
    MissingHello,

    /// The caller enqueued a close; the pump terminates once it is dequeued.
    #[error("connection closed by caller")]
    EnqueuedClose {
        /// The close payload the caller supplied.
        payload: Vec<u8>,
    },

    /// The write queue rejected an operation (closed or disposed).
    #[error("write queue error: {0}")]
    WriteQueue(#[from] crate::write_queue::WriteQueueError),
}

impl TransportError {
    /// Errors that always terminate the connection outright, even during an
    /// active session, mirroring [`starlane_core::error::ConnectionError::is_fatal_for_session`].
    #[must_use]
    pub fn is_fatal_for_session(&self) -> bool {
        matches!(
            self,
            Self::EnqueuedClose { .. } | Self::ProtocolStatus { .. } | Self::WireFormat(_) | Self::MissingHello
        )
    }
}
