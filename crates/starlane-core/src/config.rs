//! Client configuration: every tunable named by the transport, handshake, and
//! session layers, assembled into one validated struct.

use std::time::Duration;

use thiserror::Error;

/// How strictly a mismatched build commit id between client and server is
/// enforced during `ClientHelloAccepted` handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitIdCheckRule {
    /// Never fail on commit id mismatch.
    Disabled,
    /// Fail only if both sides reported a defined (non-"undefined") commit id.
    #[default]
    OnlyIfDefined,
    /// Fail on any mismatch, including an undefined value on either side.
    Strict,
}

/// Validated client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// 4-byte ASCII magic expected at the start of the protocol header.
    pub game_magic: [u8; 4],

    /// Commit-id enforcement policy.
    pub commit_id_check_rule: CommitIdCheckRule,
    /// Opaque device descriptor forwarded in the login message.
    pub device_info: Vec<u8>,
    /// Opaque payload forwarded in the login message.
    pub login_game_payload: Vec<u8>,
    /// Opaque payload forwarded in the session-start message.
    pub session_start_game_payload: Vec<u8>,

    /// Head start given to the IPv4 dial attempt before IPv6 is raced (§4.6).
    pub ipv4_head_start: Duration,
    /// Maximum age of a cached DNS entry before a fresh lookup is issued.
    pub dns_cache_max_ttl: Duration,

    /// Timeout for the initial TCP+TLS connect.
    pub connect_timeout: Duration,
    /// Timeout for reading the 8-byte protocol header.
    pub header_read_timeout: Duration,
    /// Timeout for a single in-flight read.
    pub read_timeout: Duration,
    /// Timeout for a single in-flight write.
    pub write_timeout: Duration,
    /// Idle period after which a keep-alive ping is queued on the write side.
    pub write_keepalive: Duration,
    /// Idle period after which a keep-alive ping is queued on the read side.
    pub read_keepalive: Duration,
    /// Duration after which an in-flight write emits a duration warning.
    pub warn_after_write: Duration,
    /// Duration after which an in-flight read emits a duration warning.
    pub warn_after_read: Duration,

    /// Watchdog window while still establishing the connection
    /// (`connect_timeout + 5s` by default).
    pub watchdog_initial: Duration,
    /// Watchdog window once steady state is reached.
    pub watchdog_post_handshake: Duration,
    /// Minimum watchdog window granted after resuming from an OS background
    /// suspension.
    pub watchdog_resume_from_background: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let connect_timeout = Duration::from_secs(32);
        Self {
            game_magic: *b"STAR",
            commit_id_check_rule: CommitIdCheckRule::default(),
            device_info: Vec::new(),
            login_game_payload: Vec::new(),
            session_start_game_payload: Vec::new(),
            ipv4_head_start: Duration::from_millis(250),
            dns_cache_max_ttl: Duration::from_secs(60),
            connect_timeout,
            header_read_timeout: Duration::from_secs(34),
            read_timeout: Duration::from_secs(28),
            write_timeout: Duration::from_secs(26),
            write_keepalive: Duration::from_secs(10),
            read_keepalive: Duration::from_secs(10),
            warn_after_write: Duration::from_secs(15),
            warn_after_read: Duration::from_secs(15),
            watchdog_initial: connect_timeout + Duration::from_secs(5),
            watchdog_post_handshake: Duration::from_secs(10),
            watchdog_resume_from_background: Duration::from_secs(10),
        }
    }
}

/// Errors raised by [`ClientConfig::validate`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The IPv4 head start must not exceed the overall connect timeout.
    #[error("ipv4_head_start ({head_start:?}) must not exceed connect_timeout ({connect_timeout:?})")]
    HeadStartExceedsConnectTimeout {
        /// The configured head start.
        head_start: Duration,
        /// The configured connect timeout.
        connect_timeout: Duration,
    },

    /// A duration-valued field was configured as zero where forward progress
    /// requires it to be positive.
    #[error("{field} must be greater than zero")]
    ZeroDuration {
        /// Name of the offending field.
        field: &'static str,
    },
}

impl ClientConfig {
    /// Validate cross-field invariants not expressible in the type alone.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ipv4_head_start > self.connect_timeout {
            return Err(ConfigError::HeadStartExceedsConnectTimeout {
                head_start: self.ipv4_head_start,
                connect_timeout: self.connect_timeout,
            });
        }

        for (field, value) in [
            ("connect_timeout", self.connect_timeout),
            ("header_read_timeout", self.header_read_timeout),
            ("read_timeout", self.read_timeout),
            ("write_timeout", self.write_timeout),
            ("write_keepalive", self.write_keepalive),
            ("read_keepalive", self.read_keepalive),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration { field });
            }
        }

        Ok(())
    }
}
