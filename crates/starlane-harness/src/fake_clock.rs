//! The deterministic [`Environment`] every scenario in this crate is driven
//! by.
//!
//! This is a thin re-export rather than a new type: `starlane-core` already
//! exposes its fake-clock environment as `pub mod test_utils` specifically so
//! this crate (and any other deterministic-testing consumer) can build atop
//! it without a dev-dependency cycle back into `starlane-core`'s own test
//! target.

use starlane_core::env::test_utils::MockEnv;

/// A manually-advanced, seeded-RNG [`starlane_core::env::Environment`] used
/// throughout this crate's scenario builders.
pub type FakeClock = MockEnv;
