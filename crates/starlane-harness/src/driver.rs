//! A thin driver around [`Connection`] that accumulates the actions it
//! returns, mirroring the teacher's action-capturing `SimDriver`.
//!
//! Production code reacts to each `ConnectionAction` as it is returned;
//! scenario tests usually want to inspect everything a step produced at
//! once, so this collects them into a single buffer per call.

use starlane_core::{
    config::ClientConfig,
    connection::{Connection, ConnectionAction, LoginMessage},
    env::Environment,
    reconnect::ServerEndpoint,
};

/// Wraps a [`Connection`], capturing every [`ConnectionAction`] it emits into
/// a single buffer the test can drain.
pub struct ConnectionDriver<E: Environment> {
    env: E,
    connection: Connection<E>,
    actions: Vec<ConnectionAction>,
}

impl<E: Environment> ConnectionDriver<E> {
    /// Build a driver around a fresh, not-yet-connected `Connection`.
    #[must_use]
    pub fn new(env: E, config: ClientConfig, endpoint: ServerEndpoint) -> Self {
        let connection = Connection::new(config, endpoint);
        Self { env, connection, actions: Vec::new() }
    }

    /// Direct access to the wrapped connection, for assertions or manual
    /// phase manipulation the action API doesn't cover.
    pub fn connection(&mut self) -> &mut Connection<E> {
        &mut self.connection
    }

    /// Begin the initial connection attempt.
    pub fn begin_connect(&mut self) {
        let now = self.env.now();
        let action = self.connection.begin_connect(&self.env, now);
        tracing::debug!(?action, "scenario: begin_connect");
        self.actions.push(action);
    }

    /// Feed one inbound login/session message.
    ///
    /// # Errors
    ///
    /// Returns the fatal [`starlane_core::error::ConnectionError`] if the
    /// message was rejected; any actions produced before the rejection are
    /// still captured.
    pub fn inject_login_message(
        &mut self,
        message: LoginMessage,
    ) -> Result<(), starlane_core::error::ConnectionError> {
        let now = self.env.now();
        let produced = self.connection.handle_login_message(message, &self.env, now).inspect_err(|error| {
            tracing::warn!(%error, "scenario: login message rejected");
        })?;
        self.actions.extend(produced);
        Ok(())
    }

    /// Advance the fake clock by `duration` and run one watchdog tick.
    pub fn advance(&mut self, duration: std::time::Duration)
    where
        E: FakeAdvance,
    {
        self.env.advance_clock(duration);
        let now = self.env.now();
        if let Some(action) = self.connection.tick(now) {
            self.actions.push(action);
        }
    }

    /// Drain every action captured since the last call.
    pub fn take_actions(&mut self) -> Vec<ConnectionAction> {
        std::mem::take(&mut self.actions)
    }
}

/// A narrow seam letting [`ConnectionDriver::advance`] move a fake clock
/// forward without this crate depending on `MockEnv` concretely.
pub trait FakeAdvance {
    /// Move this environment's clock forward by `duration`.
    fn advance_clock(&self, duration: std::time::Duration);
}

impl FakeAdvance for crate::fake_clock::FakeClock {
    fn advance_clock(&self, duration: std::time::Duration) {
        self.advance(duration);
    }
}

#[cfg(test)]
mod tests {
    use starlane_core::reconnect::Gateway;

    use super::*;
    use crate::fake_clock::FakeClock;

    fn endpoint() -> ServerEndpoint {
        ServerEndpoint {
            primary_gateway: Gateway { host: "primary.example".into(), port: 1, enable_tls: true },
            backup_gateways: vec![],
            cdn_base_url: "https://cdn.example".into(),
        }
    }

    #[test]
    fn begin_connect_captures_a_dial_action() {
        let env = FakeClock::default();
        let mut driver = ConnectionDriver::new(env, ClientConfig::default(), endpoint());
        driver.begin_connect();
        let actions = driver.take_actions();
        assert!(matches!(actions.as_slice(), [ConnectionAction::Dial(_)]));
    }

    #[test]
    fn operation_still_ongoing_produces_no_actions() {
        let env = FakeClock::default();
        let mut driver = ConnectionDriver::new(env, ClientConfig::default(), endpoint());
        driver.begin_connect();
        driver.take_actions();

        driver.inject_login_message(LoginMessage::OperationStillOngoing).expect("consumed silently");
        assert!(driver.take_actions().is_empty());
    }
}
