//! Single wait point multiplexing the stream pump's wake sources: socket
//! readiness, the write queue, caller-initiated cancellation, and the
//! nearest pending deadline (§4.4).
//!
//! Built directly on `tokio::select!`; the only state this module owns is
//! how to fold an arbitrary number of deadlines (read timeout, write
//! timeout, keep-alive, watchdog) into the single nearest one `select!`
//! needs, since the pump re-validates every individual deadline against
//! `env.now()` after any wake.

use std::future::Future;

use starlane_core::env::Environment;
use tokio_util::sync::CancellationToken;

/// Why [`wait`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The socket has bytes to read (or is otherwise ready per the caller's
    /// readiness future).
    Readable,
    /// The write queue has an item available to send.
    WriteReady,
    /// The caller's cancellation token fired.
    Cancelled,
    /// The nearest deadline passed without any other source waking first.
    DeadlineElapsed,
}

/// Wait until the socket is readable, the write queue has something to send,
/// cancellation is requested, or `deadline` (the nearest of however many the
/// caller is tracking) elapses.
///
/// `deadline` of `None` means "no deadline pending"; the wait then only
/// resolves via one of the other three sources.
pub async fn wait<E: Environment>(
    env: &E,
    readable: impl Future<Output = ()>,
    write_ready: impl Future<Output = ()>,
    cancellation: &CancellationToken,
    deadline: Option<E::Instant>,
) -> PollOutcome {
    let sleep_until_deadline = async {
        match deadline {
            Some(at) => {
                let now = env.now();
                if at > now {
                    env.sleep(at - now).await;
                }
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        () = readable => PollOutcome::Readable,
        () = write_ready => PollOutcome::WriteReady,
        () = cancellation.cancelled() => PollOutcome::Cancelled,
        () = sleep_until_deadline => PollOutcome::DeadlineElapsed,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use starlane_core::env::test_utils::MockEnv;

    use super::*;

    #[tokio::test]
    async fn cancellation_wins_immediately() {
        let env = MockEnv::default();
        let token = CancellationToken::new();
        token.cancel();
        let outcome = wait(
            &env,
            std::future::pending(),
            std::future::pending(),
            &token,
            None::<Duration>,
        )
        .await;
        assert_eq!(outcome, PollOutcome::Cancelled);
    }

    #[tokio::test]
    async fn write_ready_resolves_when_readable_never_does() {
        let env = MockEnv::default();
        let token = CancellationToken::new();
        let outcome =
            wait(&env, std::future::pending(), async {}, &token, None::<Duration>).await;
        assert_eq!(outcome, PollOutcome::WriteReady);
    }

    #[tokio::test]
    async fn no_deadline_never_fires_the_sleep_branch() {
        let env = MockEnv::default();
        let token = CancellationToken::new();
        let outcome =
            wait(&env, async {}, std::future::pending(), &token, None::<Duration>).await;
        assert_eq!(outcome, PollOutcome::Readable);
    }

    #[tokio::test]
    async fn past_deadline_resolves_immediately() {
        let env = MockEnv::default();
        let token = CancellationToken::new();
        let past = env.now();
        let outcome = wait(&env, std::future::pending(), std::future::pending(), &token, Some(past)).await;
        assert_eq!(outcome, PollOutcome::DeadlineElapsed);
    }
}
