//! Per-hostname, per-family resolved-address cache feeding the
//! happy-eyeballs dialer (§4.5).
//!
//! Resolution is rate-limited by a TTL per hostname; within the TTL, repeat
//! dials round-robin through the previously resolved addresses for the
//! requested family rather than re-resolving. A hostname that is already a
//! literal IP address (including the loopback addresses `127.0.0.1` /
//! `::1`) is never resolved and is always served straight from the literal,
//! bypassing the cache and TTL entirely.

#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

use std::{
    collections::HashMap,
    future::Future,
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    sync::Mutex,
    time::Duration,
};

use starlane_core::env::Environment;

/// How long a resolved address set remains fresh before the next dial
/// triggers a re-resolution.
pub const RESOLUTION_TTL: Duration = Duration::from_secs(30);

/// Which address family a [`DnsCache::resolve`] call is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    /// IPv4 (`A`) records.
    V4,
    /// IPv6 (`AAAA`) records.
    V6,
}

struct Entry<I> {
    v4: Vec<Ipv4Addr>,
    v6: Vec<Ipv6Addr>,
    resolved_at: I,
    v4_cursor: usize,
    v6_cursor: usize,
}

/// Caches DNS resolutions per hostname, split by address family, with
/// round-robin rotation within each family's address set and stale-on-failure
/// fallback.
pub struct DnsCache<E: Environment> {
    env: E,
    entries: Mutex<HashMap<String, Entry<E::Instant>>>,
}

impl<E: Environment> DnsCache<E> {
    /// Create an empty cache.
    #[must_use]
    pub fn new(env: E) -> Self {
        Self { env, entries: Mutex::new(HashMap::new()) }
    }

    /// Resolve `host`'s addresses for `family`, consulting (and updating) the
    /// cache.
    ///
    /// `resolver` is invoked only when the cache has no fresh entry for
    /// `host`; it performs the actual system resolution (e.g.
    /// [`system_resolve`]) and may return a mix of A and AAAA addresses,
    /// which are split and cached under a single shared `resolved_at` but
    /// independent round-robin cursors per family. If `resolver` fails and a
    /// stale cache entry exists, the stale entry is served rather than
    /// propagating the failure, on the theory that a recently-working
    /// address is more likely to still work than a resolver that just
    /// failed. The returned list is rotated so consecutive calls prefer
    /// different addresses first; an empty result means `host` has no
    /// addresses in the requested family.
    pub async fn resolve<F, Fut>(&self, host: &str, family: Family, resolver: F) -> Result<Vec<IpAddr>, io::Error>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<Vec<IpAddr>, io::Error>>,
    {
        if let Some(literal) = literal_address(host, family) {
            return Ok(vec![literal]);
        }
        if is_literal_other_family(host, family) {
            return Ok(Vec::new());
        }

        let fresh = {
            let entries = self.entries.lock().expect("dns cache lock poisoned");
            entries.get(host).filter(|e| self.env.now() < e.resolved_at + RESOLUTION_TTL).is_some()
        };

        if !fresh {
            match resolver(host.to_string()).await {
                Ok(addresses) if !addresses.is_empty() => {
                    let (v4, v6) = split_by_family(addresses);
                    let mut entries = self.entries.lock().expect("dns cache lock poisoned");
                    entries.insert(
                        host.to_string(),
                        Entry { v4, v6, resolved_at: self.env.now(), v4_cursor: 0, v6_cursor: 0 },
                    );
                }
                Ok(_) => {
                    // Empty result set: fall through to stale-entry handling
                    // below rather than caching nothing and retrying forever.
                }
                Err(err) => {
                    let has_stale = self.entries.lock().expect("dns cache lock poisoned").contains_key(host);
                    if !has_stale {
                        return Err(err);
                    }
                }
            }
        }

        let mut entries = self.entries.lock().expect("dns cache lock poisoned");
        let entry = entries
            .get_mut(host)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no cached or resolved address"))?;
        Ok(match family {
            Family::V4 => rotate(&entry.v4, &mut entry.v4_cursor),
            Family::V6 => rotate(&entry.v6, &mut entry.v6_cursor),
        })
    }

    /// Drop any cached entry for `host`, forcing the next resolve to hit the
    /// resolver.
    pub fn invalidate(&self, host: &str) {
        self.entries.lock().expect("dns cache lock poisoned").remove(host);
    }
}

/// Rotate `list` so it starts at `*cursor % list.len()`, advancing `cursor`
/// for the next call; returns the full list (not just the head), since a
/// failed connect must still be able to retry every remaining address.
fn rotate<T: Copy + Into<IpAddr>>(list: &[T], cursor: &mut usize) -> Vec<IpAddr> {
    if list.is_empty() {
        return Vec::new();
    }
    let start = *cursor % list.len();
    *cursor = cursor.wrapping_add(1);
    list.iter().cycle().skip(start).take(list.len()).map(|&addr| addr.into()).collect()
}

fn split_by_family(addresses: Vec<IpAddr>) -> (Vec<Ipv4Addr>, Vec<Ipv6Addr>) {
    let mut v4 = Vec::new();
    let mut v6 = Vec::new();
    for address in addresses {
        match address {
            IpAddr::V4(a) => v4.push(a),
            IpAddr::V6(a) => v6.push(a),
        }
    }
    (v4, v6)
}

/// Parse `host` as a literal address of `family`, including the well-known
/// loopback spelling, without touching the cache or a resolver.
fn literal_address(host: &str, family: Family) -> Option<IpAddr> {
    if host.eq_ignore_ascii_case("localhost") {
        return Some(match family {
            Family::V4 => IpAddr::V4(Ipv4Addr::LOCALHOST),
            Family::V6 => IpAddr::V6(Ipv6Addr::LOCALHOST),
        });
    }
    match family {
        Family::V4 => host.parse::<Ipv4Addr>().ok().map(IpAddr::V4),
        Family::V6 => host.parse::<Ipv6Addr>().ok().map(IpAddr::V6),
    }
}

/// Whether `host` is a literal address, but of the family opposite to the one
/// requested (e.g. asking for v6 addresses of a literal v4 host).
fn is_literal_other_family(host: &str, family: Family) -> bool {
    match family {
        Family::V4 => host.parse::<Ipv6Addr>().is_ok(),
        Family::V6 => host.parse::<Ipv4Addr>().is_ok(),
    }
}

/// Default resolver backing [`DnsCache::resolve`] in production: a real
/// `getaddrinfo`-backed lookup via `tokio::net::lookup_host`, returning
/// whatever mix of A/AAAA records the resolver hands back.
///
/// # Errors
///
/// Propagates whatever [`tokio::net::lookup_host`] returns (e.g. NXDOMAIN).
pub async fn system_resolve(host: String) -> io::Result<Vec<IpAddr>> {
    let addresses = tokio::net::lookup_host((host.as_str(), 0)).await?;
    Ok(addresses.map(|socket_addr| socket_addr.ip()).collect())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use starlane_core::env::test_utils::MockEnv;

    use super::*;

    #[tokio::test]
    async fn literal_ip_bypasses_resolver_entirely() {
        let cache = DnsCache::new(MockEnv::default());
        let calls = AtomicUsize::new(0);
        let addrs = cache
            .resolve("203.0.113.5", Family::V4, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(vec![]) }
            })
            .await
            .unwrap();
        assert_eq!(addrs, vec!["203.0.113.5".parse::<IpAddr>().unwrap()]);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn literal_v4_host_has_no_v6_addresses() {
        let cache = DnsCache::new(MockEnv::default());
        let addrs = cache.resolve("203.0.113.5", Family::V6, |_| async { Ok(vec![]) }).await.unwrap();
        assert!(addrs.is_empty());
    }

    #[tokio::test]
    async fn localhost_resolves_to_loopback_without_a_resolver_call() {
        let cache = DnsCache::new(MockEnv::default());
        let v4 = cache.resolve("localhost", Family::V4, |_| async { Ok(vec![]) }).await.unwrap();
        let v6 = cache.resolve("localhost", Family::V6, |_| async { Ok(vec![]) }).await.unwrap();
        assert_eq!(v4, vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]);
        assert_eq!(v6, vec![IpAddr::V6(Ipv6Addr::LOCALHOST)]);
    }

    #[tokio::test]
    async fn repeat_resolves_within_ttl_round_robin_without_calling_resolver_again() {
        let env = MockEnv::default();
        let cache = DnsCache::new(env.clone());
        let calls = AtomicUsize::new(0);
        let addrs: Vec<IpAddr> = vec!["10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap()];

        let resolver = |_: String| {
            calls.fetch_add(1, Ordering::SeqCst);
            let addrs = addrs.clone();
            async move { Ok(addrs) }
        };

        let first = cache.resolve("game.example", Family::V4, &resolver).await.unwrap();
        let second = cache.resolve("game.example", Family::V4, |_| async { Ok(vec![]) }).await.unwrap();
        assert_ne!(first[0], second[0], "round robin should rotate to the other address first");
        assert_eq!(calls.load(Ordering::SeqCst), 1, "second resolve must be served from cache");
    }

    #[tokio::test]
    async fn a_single_resolver_call_populates_both_families() {
        let env = MockEnv::default();
        let cache = DnsCache::new(env.clone());
        let calls = AtomicUsize::new(0);
        let resolver = |_: String| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(vec!["10.0.0.1".parse().unwrap(), "2001:db8::1".parse().unwrap()]) }
        };

        let v4 = cache.resolve("game.example", Family::V4, &resolver).await.unwrap();
        let v6 = cache.resolve("game.example", Family::V6, &resolver).await.unwrap();

        assert_eq!(v4, vec!["10.0.0.1".parse::<IpAddr>().unwrap()]);
        assert_eq!(v6, vec!["2001:db8::1".parse::<IpAddr>().unwrap()]);
        assert_eq!(calls.load(Ordering::SeqCst), 1, "one resolver call should feed both family lists");
    }

    #[tokio::test]
    async fn ttl_expiry_triggers_a_fresh_resolve() {
        let env = MockEnv::default();
        let cache = DnsCache::new(env.clone());
        cache.resolve("game.example", Family::V4, |_| async { Ok(vec!["10.0.0.1".parse().unwrap()]) }).await.unwrap();

        env.advance(RESOLUTION_TTL + Duration::from_secs(1));

        let calls = AtomicUsize::new(0);
        cache
            .resolve("game.example", Family::V4, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(vec!["10.0.0.2".parse().unwrap()]) }
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn resolver_failure_falls_back_to_stale_entry() {
        let env = MockEnv::default();
        let cache = DnsCache::new(env.clone());
        cache.resolve("game.example", Family::V4, |_| async { Ok(vec!["10.0.0.1".parse().unwrap()]) }).await.unwrap();
        env.advance(RESOLUTION_TTL + Duration::from_secs(1));

        let addrs = cache
            .resolve("game.example", Family::V4, |_| async {
                Err(io::Error::new(io::ErrorKind::Other, "resolver down"))
            })
            .await
            .unwrap();
        assert_eq!(addrs, vec!["10.0.0.1".parse::<IpAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn resolver_failure_with_no_prior_entry_propagates() {
        let cache = DnsCache::new(MockEnv::default());
        let err = cache
            .resolve("game.example", Family::V4, |_| async {
                Err(io::Error::new(io::ErrorKind::Other, "resolver down"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Other);
    }
}
