//! Async I/O pump for the Starlane client network core: happy-eyeballs
//! dialing, optional TLS attach, the binary-framed handshake, and the
//! steady-state read/write pump that drives a connected socket.
//!
//! This crate is the `tokio`-backed driver for
//! [`starlane_core`](https://docs.rs/starlane-core)'s Sans-IO state machines:
//! it owns the sockets, buffers, and timers that `starlane_core::Connection`
//! deliberately stays ignorant of.

pub mod abandon;
pub mod dialer;
pub mod dns_cache;
pub mod error;
pub mod events;
pub mod poll_set;
pub mod read_buffer;
pub mod tls;
pub mod transport;
pub mod write_queue;

pub use abandon::AbandonSource;
pub use dialer::{ChosenProtocol, DEFAULT_HEAD_START, DialOutcome, TcpDialer};
pub use dns_cache::{DnsCache, Family, RESOLUTION_TTL, system_resolve};
pub use error::{DialError, TlsAttachError, TransportError};
pub use events::{TransportEvent, TransportInfo};
pub use poll_set::PollOutcome;
pub use read_buffer::{DecodedFrame, ReadBuffer};
pub use transport::{Connected, HandshakeReport, TransportHandle, connect};
pub use write_queue::{OutgoingItem, SendBufferRef, WriteQueue, WriteQueueError};
