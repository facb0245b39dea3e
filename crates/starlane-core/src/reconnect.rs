//! Reconnect timing and gateway selection on connection failure (§4.10).

use std::time::Duration;

use crate::env::Environment;

/// A single gateway a client may dial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gateway {
    /// Hostname or address to dial.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Whether TLS must be attached after the TCP connection completes.
    pub enable_tls: bool,
}

/// The set of gateways and CDN base URL a client was handed for a server
/// endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerEndpoint {
    /// The gateway tried first, absent prior failures.
    pub primary_gateway: Gateway,
    /// Gateways to fall back to after repeated failures.
    pub backup_gateways: Vec<Gateway>,
    /// Base URL for CDN-hosted static assets (not dialed by this crate).
    pub cdn_base_url: String,
}

/// `"localhost"` is rewritten to `"127.0.0.1"`, a platform-level workaround
/// for environments whose resolver handles the two differently.
fn normalize_host(host: &str) -> String {
    if host.eq_ignore_ascii_case("localhost") { "127.0.0.1".to_string() } else { host.to_string() }
}

impl ServerEndpoint {
    /// Select a gateway for an initial connection attempt, given the number
    /// of prior failed initial attempts ("anomaly count").
    ///
    /// - anomaly 0 → primary.
    /// - anomaly 1 → a randomly chosen backup, if any (else primary).
    /// - anomaly >= 2 → uniform over `{primary} ∪ backups`.
    pub fn select_initial_gateway<E: Environment>(
        &self,
        anomaly_count: u32,
        env: &E,
    ) -> Gateway {
        let gateway = match anomaly_count {
            0 => &self.primary_gateway,
            1 => self.random_backup(env).unwrap_or(&self.primary_gateway),
            _ => self.random_of_all(env),
        };
        normalize_gateway(gateway)
    }

    /// Select a gateway to resume onto, given the resume-specific anomaly
    /// count (`failed_resume_attempts + max(0, successful_resumes - 1)`). If
    /// anomalies is zero, the previous gateway is reused as-is; otherwise the
    /// initial-attempt selection rule is applied.
    pub fn select_resume_gateway<E: Environment>(
        &self,
        anomaly_count: u32,
        previous_gateway: &Gateway,
        env: &E,
    ) -> Gateway {
        if anomaly_count == 0 {
            normalize_gateway(previous_gateway)
        } else {
            self.select_initial_gateway(anomaly_count, env)
        }
    }

    fn random_backup<'a, E: Environment>(&'a self, env: &E) -> Option<&'a Gateway> {
        if self.backup_gateways.is_empty() {
            return None;
        }
        let idx = env.random_index(self.backup_gateways.len());
        self.backup_gateways.get(idx)
    }

    fn random_of_all<'a, E: Environment>(&'a self, env: &E) -> &'a Gateway {
        let idx = env.random_index(1 + self.backup_gateways.len());
        if idx == 0 { &self.primary_gateway } else { &self.backup_gateways[idx - 1] }
    }
}

fn normalize_gateway(gateway: &Gateway) -> Gateway {
    Gateway {
        host: normalize_host(&gateway.host),
        port: gateway.port,
        enable_tls: gateway.enable_tls,
    }
}

/// Tracks a connection's gateway-selection anomaly counters across repeated
/// attempts.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnomalyCounters {
    /// Failed initial connection attempts since the last success.
    pub failed_initial_attempts: u32,
    /// Failed resume attempts since the last success.
    pub failed_resume_attempts: u32,
    /// Successful resumes since the last initial connection.
    pub successful_resumes: u32,
}

impl AnomalyCounters {
    /// Anomaly count used for initial-gateway selection.
    #[must_use]
    pub fn initial_anomaly_count(&self) -> u32 {
        self.failed_initial_attempts
    }

    /// Anomaly count used for resume-gateway selection.
    #[must_use]
    pub fn resume_anomaly_count(&self) -> u32 {
        self.failed_resume_attempts + self.successful_resumes.saturating_sub(1)
    }
}

/// Computes the reconnect delay schedule: zero delay on the first attempt,
/// 1 second on the second, 2 seconds on every attempt after that.
#[must_use]
pub fn reconnect_delay_for_attempt(attempt_index: u32) -> Duration {
    match attempt_index {
        0 => Duration::ZERO,
        1 => Duration::from_secs(1),
        _ => Duration::from_secs(2),
    }
}

/// Whether a reconnect attempt scheduled at `last_error_time + delay` is
/// still permitted given `deadline`. Returns `None` if the computed time is
/// at or past `deadline` ("do not reconnect").
pub fn next_reconnect_time<I: Copy + Ord + std::ops::Add<Duration, Output = I>>(
    attempt_index: u32,
    last_error_time: I,
    deadline: I,
) -> Option<I> {
    let candidate = last_error_time + reconnect_delay_for_attempt(attempt_index);
    if candidate >= deadline { None } else { Some(candidate) }
}

#[cfg(test)]
mod tests {
    use crate::env::test_utils::MockEnv;

    use super::*;

    fn endpoint() -> ServerEndpoint {
        ServerEndpoint {
            primary_gateway: Gateway { host: "primary.example".into(), port: 1, enable_tls: true },
            backup_gateways: vec![
                Gateway { host: "backup1.example".into(), port: 1, enable_tls: true },
                Gateway { host: "backup2.example".into(), port: 1, enable_tls: true },
            ],
            cdn_base_url: "https://cdn.example".into(),
        }
    }

    #[test]
    fn anomaly_zero_always_picks_primary() {
        let env = MockEnv::default();
        let gw = endpoint().select_initial_gateway(0, &env);
        assert_eq!(gw.host, "primary.example");
    }

    #[test]
    fn anomaly_one_picks_a_backup() {
        let env = MockEnv::default();
        let gw = endpoint().select_initial_gateway(1, &env);
        assert_ne!(gw.host, "primary.example");
    }

    #[test]
    fn localhost_is_rewritten_to_loopback() {
        let env = MockEnv::default();
        let mut ep = endpoint();
        ep.primary_gateway.host = "localhost".to_string();
        let gw = ep.select_initial_gateway(0, &env);
        assert_eq!(gw.host, "127.0.0.1");
    }

    #[test]
    fn resume_with_no_anomalies_reuses_previous_gateway() {
        let env = MockEnv::default();
        let previous = Gateway { host: "sticky.example".into(), port: 7, enable_tls: false };
        let gw = endpoint().select_resume_gateway(0, &previous, &env);
        assert_eq!(gw, previous);
    }

    #[test]
    fn scenario_s6_reconnect_schedule() {
        use std::time::Duration as D;

        let deadline = D::from_secs(10);
        assert_eq!(next_reconnect_time(0u32, D::ZERO, deadline), Some(D::ZERO));
        assert_eq!(next_reconnect_time(1u32, D::ZERO, deadline), Some(D::from_secs(1)));
        assert_eq!(next_reconnect_time(4u32, D::from_secs(5), deadline), Some(D::from_secs(7)));
        assert_eq!(next_reconnect_time(4u32, D::from_secs(7), deadline), Some(D::from_secs(9)));
        assert_eq!(next_reconnect_time(4u32, D::from_secs(9), deadline), None);
    }

    #[test]
    fn delay_sequence_matches_spec() {
        let delays: Vec<_> = (0..5).map(reconnect_delay_for_attempt).collect();
        assert_eq!(
            delays,
            vec![
                Duration::ZERO,
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(2),
                Duration::from_secs(2),
            ]
        );
    }
}
