//! Sans-IO session and connection state machines for the Starlane client
//! network core.
//!
//! Nothing in this crate touches a socket, a clock, or a source of
//! randomness directly: every time- or randomness-dependent operation goes
//! through the [`env::Environment`] trait, so the full login/handshake/
//! session/reconnect state machine can be driven deterministically under a
//! fake clock in tests. [`starlane_net`](https://docs.rs/starlane-net) is the
//! async driver that feeds this crate's types from real sockets.

pub mod config;
pub mod connection;
pub mod env;
pub mod error;
pub mod ping;
pub mod reconnect;
pub mod session;

pub use config::{ClientConfig, CommitIdCheckRule, ConfigError};
pub use connection::{Connection, ConnectionAction, ConnectionPhase, LoginMessage};
pub use env::Environment;
pub use error::{ConnectionError, SessionError};
pub use ping::{LatencySample, PingTracker, decode_latency_pong, encode_latency_ping};
pub use reconnect::{AnomalyCounters, Gateway, ServerEndpoint, next_reconnect_time, reconnect_delay_for_attempt};
pub use session::{DevChecksums, ResumeOutcome, SessionParticipantState, handle_resume};
