//! Happy-eyeballs TCP dialer: races an IPv4 attempt against IPv6 with a
//! configurable head-start for whichever family resolves first, so a slow or
//! black-holed address family never blocks the connection (§4.6).

use std::{net::IpAddr, time::Duration};

use futures_util::future::{self, Either};
use starlane_core::env::Environment;
use tokio::{net::TcpStream, task::JoinHandle};

use crate::{
    abandon::{self, AbandonSource},
    dns_cache::{DnsCache, Family, system_resolve},
    error::DialError,
};

/// Default head-start given to IPv4 before racing in IPv6 alongside it.
pub const DEFAULT_HEAD_START: Duration = Duration::from_millis(250);

/// Which address family won the dial race.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChosenProtocol {
    /// The winning attempt connected over IPv4.
    IPv4,
    /// The winning attempt connected over IPv6.
    IPv6,
}

/// The result of a successful happy-eyeballs race: the connected stream plus
/// which address actually won, so the handshake report (scenario S1) can
/// name it.
pub struct DialOutcome {
    /// The connected stream.
    pub stream: TcpStream,
    /// The address that won the race.
    pub chosen_address: IpAddr,
}

impl DialOutcome {
    /// Which protocol family [`Self::chosen_address`] belongs to.
    #[must_use]
    pub fn chosen_protocol(&self) -> ChosenProtocol {
        if self.chosen_address.is_ipv4() { ChosenProtocol::IPv4 } else { ChosenProtocol::IPv6 }
    }
}

/// Outcome of exhausting every address in one family.
struct FamilyDialFailure {
    any_refused: bool,
}

type FamilyResult = Result<DialOutcome, FamilyDialFailure>;
type FamilyJoin = JoinHandle<FamilyResult>;

/// Dials one host:port, happy-eyeballs style, resolving addresses through an
/// internal [`DnsCache`].
pub struct TcpDialer<E: Environment> {
    env: E,
    head_start: Duration,
    dns_cache: DnsCache<E>,
}

impl<E: Environment> TcpDialer<E> {
    /// Create a dialer using the default head-start.
    #[must_use]
    pub fn new(env: E) -> Self {
        Self::with_head_start(env, DEFAULT_HEAD_START)
    }

    /// Create a dialer with an explicit head-start between the v4 and v6
    /// attempts.
    #[must_use]
    pub fn with_head_start(env: E, head_start: Duration) -> Self {
        let dns_cache = DnsCache::new(env.clone());
        Self { env, head_start, dns_cache }
    }

    /// This dialer's address cache, exposed so a long-lived caller can
    /// pre-warm or invalidate entries (e.g. after a reconnect decides the
    /// previous address is no longer good).
    #[must_use]
    pub fn dns_cache(&self) -> &DnsCache<E> {
        &self.dns_cache
    }

    /// Resolve `host` for both families and race a v4 attempt against v6
    /// (§4.6):
    ///
    /// 1. Start the v4 attempt, if `host` has any v4 addresses; wait up to
    ///    `head_start` or for it to succeed.
    /// 2. If v4 succeeds within the head-start, return it without ever
    ///    starting v6.
    /// 3. Otherwise start the v6 attempt alongside the still-running v4 one.
    /// 4. Await whichever finishes first successfully. The loser, if still
    ///    running, is left to finish in the background; if it later connects
    ///    anyway, it sends the abandon message (§9) and closes rather than
    ///    leaving the peer to account for a socket nobody will use.
    /// 5. If both end in failure, surface [`DialError::ConnectionRefused`]
    ///    if any address was refused, else [`DialError::CouldNotConnect`].
    ///
    /// Each family's own inner attempt tries its addresses sequentially, in
    /// the order [`DnsCache`] returns them, remembering a refusal but
    /// continuing to the next address rather than stopping early.
    ///
    /// # Errors
    ///
    /// [`DialError::NoAddresses`] if `host` resolves to no addresses in
    /// either family. [`DialError::ConnectionRefused`] /
    /// [`DialError::CouldNotConnect`] as described above.
    pub async fn connect(&self, host: &str, port: u16) -> Result<DialOutcome, DialError> {
        self.connect_via(host, port, system_resolve).await
    }

    /// Same race as [`Self::connect`], parameterized over the resolver
    /// backing [`DnsCache::resolve`] so tests can supply synthetic addresses
    /// instead of hitting a real resolver.
    async fn connect_via<F, Fut>(&self, host: &str, port: u16, resolver: F) -> Result<DialOutcome, DialError>
    where
        F: Fn(String) -> Fut + Copy,
        Fut: std::future::Future<Output = std::io::Result<Vec<IpAddr>>>,
    {
        let v4_addresses = self.dns_cache.resolve(host, Family::V4, resolver).await.unwrap_or_default();
        let v6_addresses = self.dns_cache.resolve(host, Family::V6, resolver).await.unwrap_or_default();
        if v4_addresses.is_empty() && v6_addresses.is_empty() {
            return Err(DialError::NoAddresses);
        }

        let race_start = self.env.now();
        let mut any_refused = false;

        let mut v4_task: Option<FamilyJoin> =
            (!v4_addresses.is_empty()).then(|| tokio::spawn(dial_family(v4_addresses, port)));

        if let Some(handle) = v4_task.take() {
            match future::select(handle, std::pin::pin!(self.env.sleep(self.head_start))).await {
                Either::Left((joined, _sleep)) => match join_to_family_result(joined) {
                    Ok(outcome) => return Ok(outcome),
                    Err(failure) => any_refused |= failure.any_refused,
                },
                Either::Right(((), handle)) => v4_task = Some(handle),
            }
        }

        let v6_started_at = self.env.now();
        let v6_task: Option<FamilyJoin> =
            (!v6_addresses.is_empty()).then(|| tokio::spawn(dial_family(v6_addresses, port)));

        match (v4_task, v6_task) {
            (Some(v4h), Some(v6h)) => match future::select(v4h, v6h).await {
                Either::Left((v4_joined, v6h)) => match join_to_family_result(v4_joined) {
                    Ok(outcome) => {
                        self.spawn_abandon_on_late_success(v6h, race_start, v6_started_at);
                        Ok(outcome)
                    }
                    Err(failure) => {
                        any_refused |= failure.any_refused;
                        await_remaining(v6h, any_refused).await
                    }
                },
                Either::Right((v6_joined, v4h)) => match join_to_family_result(v6_joined) {
                    Ok(outcome) => {
                        self.spawn_abandon_on_late_success(v4h, race_start, race_start);
                        Ok(outcome)
                    }
                    Err(failure) => {
                        any_refused |= failure.any_refused;
                        await_remaining(v4h, any_refused).await
                    }
                },
            },
            (Some(handle), None) | (None, Some(handle)) => await_remaining(handle, any_refused).await,
            (None, None) => Err(classify(any_refused)),
        }
    }

    /// Await `loser` in a detached task; if it connects anyway after already
    /// having lost the race, send the abandon message over it and close.
    fn spawn_abandon_on_late_success(&self, loser: FamilyJoin, race_start: E::Instant, attempt_started_at: E::Instant) {
        let env = self.env.clone();
        tokio::spawn(async move {
            if let Ok(Ok(outcome)) = loser.await {
                let abandoned_at = env.now();
                abandon::send_and_close(
                    outcome.stream,
                    AbandonSource::Dialer,
                    attempt_started_at - race_start,
                    abandoned_at - race_start,
                )
                .await;
            }
        });
    }
}

async fn await_remaining(handle: FamilyJoin, mut any_refused: bool) -> Result<DialOutcome, DialError> {
    match join_to_family_result(handle.await) {
        Ok(outcome) => Ok(outcome),
        Err(failure) => {
            any_refused |= failure.any_refused;
            Err(classify(any_refused))
        }
    }
}

fn classify(any_refused: bool) -> DialError {
    if any_refused { DialError::ConnectionRefused } else { DialError::CouldNotConnect }
}

fn join_to_family_result(joined: Result<FamilyResult, tokio::task::JoinError>) -> FamilyResult {
    match joined {
        Ok(result) => result,
        Err(_join_err) => Err(FamilyDialFailure { any_refused: false }),
    }
}

/// Sequentially try every address in `addresses`, returning the first
/// successful connection. `ConnectionRefused` on one address is remembered
/// but does not stop the family from trying the next (§4.6 step 6).
async fn dial_family(addresses: Vec<IpAddr>, port: u16) -> FamilyResult {
    let mut any_refused = false;
    for address in addresses {
        match TcpStream::connect((address, port)).await {
            Ok(stream) => return Ok(DialOutcome { stream, chosen_address: address }),
            Err(err) => {
                if err.kind() == std::io::ErrorKind::ConnectionRefused {
                    any_refused = true;
                }
            }
        }
    }
    Err(FamilyDialFailure { any_refused })
}
