//! Error taxonomy for the session and connection layers.
//!
//! Mirrors the wire-level [`starlane_proto::CodecError`] with the higher-level
//! kinds named in the protocol: session bookkeeping violations, handshake
//! rejections, and watchdog/timeout classification. We avoid using
//! `std::io::Error` for this logic to keep it testable without touching a
//! socket; `io::Error` only appears at the transport boundary (see
//! `starlane-net`'s `TransportError`).

use std::time::Duration;

use starlane_proto::{ClusterStatus, CodecError};
use thiserror::Error;

/// Errors raised by [`crate::session::SessionLayer`] ack validation and resume.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Peer acknowledged more payload messages than we ever sent.
    #[error("peer's num_received ({their_num_received}) exceeds our num_sent ({our_num_sent})")]
    TheirNumReceivedTooHigh {
        /// Peer's claimed acknowledged-count.
        their_num_received: u32,
        /// Our actual sent-count.
        our_num_sent: u32,
    },

    /// Peer's acknowledgement moved backwards, violating monotonicity.
    #[error(
        "peer's num_received ({their_num_received}) is below our already-acknowledged count \
         ({our_num_acknowledged_sent})"
    )]
    TheirNumReceivedTooLow {
        /// Peer's claimed acknowledged-count.
        their_num_received: u32,
        /// Our previously recorded acknowledged-count.
        our_num_acknowledged_sent: u32,
    },

    /// `handle_resume` was called with no retained session state.
    #[error("cannot resume: we have no session")]
    WeHaveNoSession,

    /// The resuming transport presented a different session token.
    #[error("cannot resume: session token mismatch")]
    TokenMismatch,

    /// The peer's ack implies messages we already dropped from
    /// `remembered_sent` under [`crate::session::SessionParticipantState::limit_remembered_sent`].
    #[error(
        "cannot resume: we have forgotten too many messages (our_num_sent={our_num_sent}, \
         our_num_remembered={our_num_remembered}, their_num_received={their_num_received})"
    )]
    WeHaveForgottenTooMany {
        /// Our total sent-count at the time of resume.
        our_num_sent: u32,
        /// How many unacknowledged messages we still retained.
        our_num_remembered: u32,
        /// The peer's claimed received-count.
        their_num_received: u32,
    },
}

/// Errors raised by [`crate::connection::Connection`]'s handshake and
/// steady-state handling.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// A message arrived that the current handshake phase does not accept.
    #[error("unexpected login message {type_name:?} in phase {phase:?}")]
    UnexpectedLoginMessage {
        /// Name of the message type that was rejected.
        type_name: String,
        /// The phase that rejected it.
        phase: String,
    },

    /// The server rejected the connection via its protocol-header status.
    #[error("server rejected connection: {status:?}")]
    ProtocolStatus {
        /// The disqualifying status the server reported.
        status: ClusterStatus,
    },

    /// The handshake completed its byte exchange but did not contain a valid
    /// `ServerHello`.
    #[error("missing or malformed ServerHello during handshake")]
    MissingHello,

    /// A wire-level codec failure (framing, magic, version, size caps).
    #[error("wire format error: {0}")]
    WireFormat(#[from] CodecError),

    /// Client and server logic versions are incompatible.
    #[error("logic version mismatch: client supports {client_range}, server is {server_version}")]
    LogicVersionMismatch {
        /// Client's supported version range, formatted for display.
        client_range: String,
        /// Server's reported version.
        server_version: String,
    },

    /// Client's login protocol version is incompatible with the server.
    #[error("login protocol version mismatch")]
    LoginProtocolVersionMismatch,

    /// The server redirected the client to a different endpoint.
    #[error("redirected to another server: {endpoint}")]
    RedirectToServer {
        /// The endpoint the server redirected to.
        endpoint: String,
    },

    /// `commit_id_check_rule` rejected a commit-id mismatch with the server.
    #[error("commit id mismatch")]
    CommitIdMismatch,

    /// The server rejected session start with a message.
    #[error("session start failed: {message}")]
    SessionStartFailed {
        /// Server-provided failure detail.
        message: String,
    },

    /// The server rejected a session resume attempt.
    #[error("session resume failed")]
    SessionResumeFailed,

    /// The session layer rejected a resume attempt locally.
    #[error("session layer rejected resume: {0}")]
    SessionResumeRejected(#[from] SessionError),

    /// The server forcibly terminated the session.
    #[error("session force-terminated: {reason}")]
    SessionForceTerminated {
        /// Server-provided reason.
        reason: String,
    },

    /// A generic session-layer error surfaced from the server.
    #[error("session error: {0}")]
    SessionErrorFromServer(String),

    /// The cooperative watchdog deadline elapsed.
    #[error("watchdog deadline exceeded after {elapsed:?} (kind={kind})")]
    WatchdogDeadlineExceeded {
        /// Time since the watchdog was last reset.
        elapsed: Duration,
        /// Which pipeline stage's watchdog expired.
        kind: &'static str,
    },

    /// The server reported this player/device as banned.
    #[error("player is banned")]
    PlayerIsBanned,

    /// A server payload failed to deserialize.
    #[error("player deserialization failure: {0}")]
    PlayerDeserializationFailure(String),

    /// The server is in maintenance mode and is not accepting sessions.
    #[error("maintenance mode ongoing")]
    MaintenanceModeOngoing,

    /// The client's logic version is older than the server will accept.
    #[error("logic version downgrade not permitted")]
    LogicVersionDowngrade,

    /// An unclassified service failure reported by the server.
    #[error("service failure: {0}")]
    ServiceFailure(String),

    /// The underlying transport failed or was lost.
    #[error("transport error: {0}")]
    Transport(String),

    /// The caller explicitly enqueued a close.
    #[error("connection closed by caller: {payload:?}")]
    EnqueuedClose {
        /// The close payload the caller supplied.
        payload: Vec<u8>,
    },
}

impl ConnectionError {
    /// Errors that always terminate the connection outright, even during an
    /// active session (as opposed to entering `WaitResumeAfterDrop`).
    #[must_use]
    pub fn is_fatal_for_session(&self) -> bool {
        matches!(
            self,
            Self::EnqueuedClose { .. }
                | Self::ProtocolStatus { .. }
                | Self::WireFormat(_)
                | Self::MissingHello
        )
    }

    /// Errors that may succeed if the caller retries (timeouts, transient
    /// transport loss), as opposed to protocol violations that indicate a
    /// broken or incompatible peer.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::WatchdogDeadlineExceeded { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_kinds_are_fatal_for_session() {
        assert!(ConnectionError::EnqueuedClose { payload: vec![] }.is_fatal_for_session());
        assert!(
            ConnectionError::ProtocolStatus { status: ClusterStatus::ClusterShuttingDown }
                .is_fatal_for_session()
        );
        assert!(ConnectionError::MissingHello.is_fatal_for_session());
    }

    #[test]
    fn transient_kinds_are_not_fatal_for_session() {
        let err = ConnectionError::Transport("reset by peer".to_string());
        assert!(!err.is_fatal_for_session());
        assert!(err.is_transient());
    }

    #[test]
    fn protocol_violations_are_not_transient() {
        assert!(!ConnectionError::CommitIdMismatch.is_transient());
        assert!(!ConnectionError::LoginProtocolVersionMismatch.is_transient());
    }

    #[test]
    fn session_resume_rejection_wraps_session_error() {
        let err: ConnectionError = SessionError::WeHaveNoSession.into();
        assert!(matches!(err, ConnectionError::SessionResumeRejected(SessionError::WeHaveNoSession)));
    }
}
