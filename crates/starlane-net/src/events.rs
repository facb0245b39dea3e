//! Events the [`crate::transport::StreamTransport`] pump surfaces to its
//! caller, matching the teacher's action-returning style: the pump never
//! calls back directly, it hands the caller a vector of events to act on.

use bytes::Bytes;

use crate::error::TransportError;

/// A side-band event surfaced in write order, interleaved with data frames.
#[derive(Debug, Clone)]
pub enum TransportInfo {
    /// One pump cycle completed; emitted for external liveness monitoring.
    ThreadCycleUpdate,
    /// A read took long enough to warrant surfacing, begin/end pair.
    ReadDurationWarningBegin,
    /// The slow read referenced by the most recent begin warning completed.
    ReadDurationWarningEnd,
    /// A write took long enough to warrant surfacing, begin/end pair.
    WriteDurationWarningBegin,
    /// The slow write referenced by the most recent begin warning completed.
    WriteDurationWarningEnd,
    /// A latency-sample ping received its matching pong.
    LatencySample {
        /// Id of the completed sample.
        sample_id: u32,
        /// Measured round-trip time in milliseconds.
        round_trip_millis: u64,
    },
}

/// One event produced by a [`crate::transport::StreamTransport`] pump cycle.
#[derive(Debug)]
pub enum TransportEvent {
    /// The handshake completed; carries the server's hello payload.
    Connected {
        /// The application payload of the server's hello message.
        server_hello: Bytes,
    },
    /// An application payload message arrived from the peer.
    Received(Bytes),
    /// A side-band info event (see [`TransportInfo`]).
    Info(TransportInfo),
    /// The pump stopped, successfully or otherwise.
    Stopped(Option<TransportError>),
}
