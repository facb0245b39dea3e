//! Testability seam abstracting wall-clock time, sleeping, and randomness.
//!
//! Every time- or randomness-dependent component in this crate (the watchdog,
//! the reconnect schedule, gateway selection) is generic over an
//! [`Environment`] rather than calling `std::time::Instant::now()` or a
//! global RNG directly. Production code uses a real-clock implementation;
//! tests use a fake clock that advances under the test's control, so
//! duration-based scenarios (keep-alive timing, reconnect schedules) run
//! deterministically and instantly.

use std::{
    future::Future,
    ops::{Add, Sub},
    time::Duration,
};

/// A source of time and randomness that the state machines in this crate are
/// generic over.
pub trait Environment: Clone + Send + Sync + 'static {
    /// This environment's notion of an instant in time.
    type Instant: Copy
        + Ord
        + Send
        + Sync
        + Sub<Output = Duration>
        + Add<Duration, Output = Self::Instant>;

    /// The current instant.
    fn now(&self) -> Self::Instant;

    /// Suspend for `duration` according to this environment's clock.
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;

    /// Fill `buffer` with random bytes.
    fn random_bytes(&self, buffer: &mut [u8]);

    /// A random `u64`, built atop [`Environment::random_bytes`].
    fn random_u64(&self) -> u64 {
        let mut buf = [0u8; 8];
        self.random_bytes(&mut buf);
        u64::from_le_bytes(buf)
    }

    /// A random index in `0..len`, or `0` if `len == 0`.
    fn random_index(&self, len: usize) -> usize {
        if len == 0 { 0 } else { (self.random_u64() % len as u64) as usize }
    }
}

/// A real-clock [`Environment`] backed by `tokio::time` and `rand`'s
/// thread-local, OS-seeded CSPRNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnvironment;

impl Environment for SystemEnvironment {
    type Instant = tokio::time::Instant;

    fn now(&self) -> Self::Instant {
        tokio::time::Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        use rand::RngCore;

        rand::thread_rng().fill_bytes(buffer);
    }
}

/// Fake-clock [`Environment`] and other deterministic-testing utilities.
///
/// Kept `pub` (rather than `#[cfg(test)]`-gated) so that downstream crates
/// such as `starlane-harness` can build scenario drivers atop it without a
/// dev-dependency cycle back into this crate's own test target.
#[allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]
pub mod test_utils {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use super::Environment;

    /// A manually-advanced instant used by [`MockEnv`].
    pub type MockInstant = Duration;

    #[derive(Debug, Default)]
    struct Inner {
        now: Duration,
        rng_state: u64,
    }

    /// A deterministic [`Environment`] whose clock only moves when
    /// [`MockEnv::advance`] is called, and whose randomness is a seeded
    /// reproducible stream.
    #[derive(Debug, Clone)]
    pub struct MockEnv {
        inner: Arc<Mutex<Inner>>,
    }

    impl Default for MockEnv {
        fn default() -> Self {
            Self::new(0xC0FF_EE15_BEEF_CAFE)
        }
    }

    impl MockEnv {
        /// Create a mock environment with the given RNG seed, clock at zero.
        #[must_use]
        pub fn new(seed: u64) -> Self {
            Self { inner: Arc::new(Mutex::new(Inner { now: Duration::ZERO, rng_state: seed | 1 })) }
        }

        /// Advance the mock clock by `duration`.
        pub fn advance(&self, duration: Duration) {
            let mut inner = self.inner.lock().expect("mock env lock poisoned");
            inner.now += duration;
        }
    }

    impl Environment for MockEnv {
        type Instant = MockInstant;

        fn now(&self) -> Self::Instant {
            self.inner.lock().expect("mock env lock poisoned").now
        }

        async fn sleep(&self, duration: Duration) {
            self.advance(duration);
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            let mut inner = self.inner.lock().expect("mock env lock poisoned");
            for chunk in buffer.chunks_mut(8) {
                let mut x = inner.rng_state;
                x ^= x << 13;
                x ^= x >> 7;
                x ^= x << 17;
                inner.rng_state = x;
                let bytes = x.to_le_bytes();
                chunk.copy_from_slice(&bytes[..chunk.len()]);
            }
        }
    }

}
