//! Deterministic test harness for `starlane-core` and `starlane-net`.
//!
//! Combines a fake clock ([`fake_clock::FakeClock`]), a `Connection` driver
//! that feeds [`starlane_core::connection::LoginMessage`]s and collects
//! [`starlane_core::connection::ConnectionAction`]s in scenario order
//! ([`driver::ConnectionDriver`]), and transport-level fault/latency
//! middlewares ([`middleware`]) so end-to-end scenarios like the ones in
//! §4.12's literal test table can be driven without a real socket.
//!
//! Everything here is dev/test tooling: none of it is exercised by
//! production connection setup.

pub mod driver;
pub mod fake_clock;
pub mod middleware;

pub use driver::ConnectionDriver;
pub use fake_clock::FakeClock;
pub use middleware::{CommandSink, FaultInjectorHandle, FaultInjectorMiddleware, FaultTiming, LatencySimMiddleware};
