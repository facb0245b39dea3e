//! At-least-once payload delivery: numbered acknowledgements, resume
//! validation, and remembered-sent queue limiting.
//!
//! [`SessionParticipantState`] is the per-endpoint bookkeeping kept by both
//! sides of a session; the methods here are the stateless-over-their-input
//! helpers described as `SessionLayer` in the component design. Nothing in
//! this module touches a socket or a clock — it is exercised directly by
//! unit and property tests.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::error::SessionError;

/// Optional development-time integrity tracking for the received and
/// forgotten-sent streams. Disabled (`None`) in production; when present,
/// a simple rolling checksum lets tests detect reordering or loss that the
/// sequence-number invariants alone would miss.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DevChecksums {
    /// Rolling checksum of received payload bytes, in order.
    pub received: u64,
    /// Rolling checksum of forgotten (acknowledged-and-dropped) sent payload
    /// bytes, in order.
    pub forgotten_sent: u64,
}

impl DevChecksums {
    fn fold(running: u64, bytes: &[u8]) -> u64 {
        bytes.iter().fold(running, |acc, &b| acc.rotate_left(8) ^ u64::from(b))
    }
}

/// Per-endpoint session bookkeeping, kept by both the client and (mirrored)
/// by the server.
#[derive(Debug, Clone)]
pub struct SessionParticipantState {
    /// Opaque identity of the session.
    pub token: u64,
    /// Total payload messages we've sent.
    pub num_sent: u32,
    /// Payload messages sent but not yet forgotten (still subject to replay).
    pub remembered_sent: VecDeque<Bytes>,
    /// How many of our sent messages the peer has confirmed receipt of.
    pub num_acknowledged_sent: u32,
    /// Payload messages received from the peer.
    pub num_received: u32,
    /// The last `num_received` value we sent back to the peer in an ack.
    pub acknowledged_num_received: u32,
    /// Optional dev-time stream checksums; `None` in production.
    pub dev_checksums: Option<DevChecksums>,
}

/// The caller must send an acknowledgement once `num_received` has advanced
/// this far past the last value we told the peer.
pub const ACK_EVERY_N_MESSAGES: u32 = 5;

impl SessionParticipantState {
    /// Start a fresh session bound to `token`.
    #[must_use]
    pub fn new(token: u64) -> Self {
        Self {
            token,
            num_sent: 0,
            remembered_sent: VecDeque::new(),
            num_acknowledged_sent: 0,
            num_received: 0,
            acknowledged_num_received: 0,
            dev_checksums: None,
        }
    }

    /// How many of our sent-but-unacknowledged messages we no longer retain
    /// ( `num_sent - remembered_sent.len()` ). Always `>= num_acknowledged_sent`.
    #[must_use]
    pub fn num_forgotten_by_us(&self) -> u32 {
        self.num_sent - self.remembered_sent.len() as u32
    }

    /// Record that we are sending a new payload message: remember it for
    /// possible replay and advance `num_sent`.
    pub fn on_send_payload(&mut self, msg: impl Into<Bytes>) {
        self.remembered_sent.push_back(msg.into());
        self.num_sent += 1;
    }

    /// Record receipt of a payload message (not an acknowledgement) from the
    /// peer. Returns `true` if the caller must now send an acknowledgement
    /// back (and should then call [`Self::record_ack_sent`]).
    pub fn on_receive_payload(&mut self, payload: &[u8]) -> bool {
        self.num_received += 1;
        if let Some(checksums) = &mut self.dev_checksums {
            checksums.received = DevChecksums::fold(checksums.received, payload);
        }
        self.num_received >= self.acknowledged_num_received + ACK_EVERY_N_MESSAGES
    }

    /// Record that we have just sent an acknowledgement reflecting our
    /// current `num_received`.
    pub fn record_ack_sent(&mut self) {
        self.acknowledged_num_received = self.num_received;
    }

    /// Validate and apply a peer acknowledgement during steady-state
    /// operation (§4.9.1). Strictly monotonic: an ack below our last applied
    /// ack is rejected rather than silently ignored, since it indicates the
    /// peer's view of our send stream has regressed.
    pub fn apply_ack(&mut self, their_num_received: u32) -> Result<(), SessionError> {
        if their_num_received > self.num_sent {
            return Err(SessionError::TheirNumReceivedTooHigh {
                their_num_received,
                our_num_sent: self.num_sent,
            });
        }
        if their_num_received < self.num_acknowledged_sent {
            return Err(SessionError::TheirNumReceivedTooLow {
                their_num_received,
                our_num_acknowledged_sent: self.num_acknowledged_sent,
            });
        }

        self.forget_up_to(their_num_received);
        self.num_acknowledged_sent = their_num_received;
        Ok(())
    }

    /// Drop from the front of `remembered_sent` until its length is at most
    /// `limit`. Each drop irrecoverably forgets that message: it can no
    /// longer be replayed on resume, even if never acknowledged.
    pub fn limit_remembered_sent(&mut self, limit: usize) {
        while self.remembered_sent.len() > limit {
            self.forget_one();
        }
    }

    /// Iterate the messages still eligible for replay, oldest first.
    pub fn replay_remembered(&self) -> impl Iterator<Item = &Bytes> {
        self.remembered_sent.iter()
    }

    fn forget_up_to(&mut self, their_num_received: u32) {
        let newly_forget = their_num_received.saturating_sub(self.num_forgotten_by_us());
        for _ in 0..newly_forget {
            self.forget_one();
        }
    }

    fn forget_one(&mut self) {
        if let Some(msg) = self.remembered_sent.pop_front()
            && let Some(checksums) = &mut self.dev_checksums
        {
            checksums.forgotten_sent = DevChecksums::fold(checksums.forgotten_sent, &msg);
        }
    }
}

/// Everything a successful resume hands back to the pump: the acknowledged
/// state has been applied, and these messages must now be replayed, in
/// order, onto the new transport.
#[derive(Debug, Clone)]
pub struct ResumeOutcome {
    /// Messages to replay onto the new transport, oldest first.
    pub replay: Vec<Bytes>,
}

/// Validate and apply a resume request (§4.9.2) against existing session
/// state, if any.
///
/// During resume, only the high-side sanity bound (`their_num_received <=
/// num_sent`) and the forgotten-too-many bound are enforced; the raw
/// monotonic low-side check from [`SessionParticipantState::apply_ack`] is
/// intentionally not applied here; the forgotten-too-many bound subsumes it
/// because `num_forgotten_by_us() >= num_acknowledged_sent` always holds, so
/// any ack low enough to violate monotonicity is also low enough to violate
/// the replay-retention bound, and should be reported as that more specific
/// cause.
///
/// # Errors
///
/// Returns [`SessionError::WeHaveNoSession`], [`SessionError::TokenMismatch`],
/// [`SessionError::TheirNumReceivedTooHigh`], or
/// [`SessionError::WeHaveForgottenTooMany`].
pub fn handle_resume(
    existing: Option<&mut SessionParticipantState>,
    their_token: u64,
    their_num_received: u32,
) -> Result<ResumeOutcome, SessionError> {
    let state = existing.ok_or(SessionError::WeHaveNoSession)?;

    if state.token != their_token {
        return Err(SessionError::TokenMismatch);
    }

    if their_num_received > state.num_sent {
        return Err(SessionError::TheirNumReceivedTooHigh {
            their_num_received,
            our_num_sent: state.num_sent,
        });
    }

    let floor = state.num_forgotten_by_us();
    if their_num_received < floor {
        return Err(SessionError::WeHaveForgottenTooMany {
            our_num_sent: state.num_sent,
            our_num_remembered: state.remembered_sent.len() as u32,
            their_num_received,
        });
    }

    state.forget_up_to(their_num_received);
    state.num_acknowledged_sent = their_num_received;

    Ok(ResumeOutcome { replay: state.remembered_sent.iter().cloned().collect() })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_then_ack_forgets_acknowledged_prefix() {
        let mut state = SessionParticipantState::new(1);
        for i in 0..10u8 {
            state.on_send_payload(vec![i]);
        }
        assert_eq!(state.num_sent, 10);
        assert_eq!(state.remembered_sent.len(), 10);

        state.apply_ack(7).expect("ack should apply");
        assert_eq!(state.num_acknowledged_sent, 7);
        assert_eq!(state.remembered_sent.len(), 3);
        assert_eq!(state.remembered_sent.front(), Some(&Bytes::from_static(&[7])));
    }

    #[test]
    fn ack_above_num_sent_is_rejected() {
        let mut state = SessionParticipantState::new(1);
        state.on_send_payload(vec![0]);
        let err = state.apply_ack(5).unwrap_err();
        assert!(matches!(err, SessionError::TheirNumReceivedTooHigh { .. }));
    }

    #[test]
    fn ack_regression_is_rejected() {
        let mut state = SessionParticipantState::new(1);
        for i in 0..5u8 {
            state.on_send_payload(vec![i]);
        }
        state.apply_ack(4).expect("first ack");
        let err = state.apply_ack(2).unwrap_err();
        assert!(matches!(err, SessionError::TheirNumReceivedTooLow { .. }));
    }

    #[test]
    fn receive_triggers_ack_due_every_five_messages() {
        let mut state = SessionParticipantState::new(1);
        for i in 0..4 {
            assert!(!state.on_receive_payload(&[i]), "ack should not be due yet");
        }
        assert!(state.on_receive_payload(&[4]), "fifth message should trigger ack");
        state.record_ack_sent();
        assert_eq!(state.acknowledged_num_received, 5);
    }

    #[test]
    fn limit_remembered_sent_forgets_from_front() {
        let mut state = SessionParticipantState::new(1);
        for i in 0..10u8 {
            state.on_send_payload(vec![i]);
        }
        state.limit_remembered_sent(4);
        assert_eq!(state.remembered_sent.len(), 4);
        assert_eq!(state.remembered_sent.front(), Some(&Bytes::from_static(&[6])));
        assert_eq!(state.num_forgotten_by_us(), 6);
    }

    #[test]
    fn resume_forgets_too_many_scenario_s3() {
        let mut state = SessionParticipantState::new(42);
        for i in 0..10u8 {
            state.on_send_payload(vec![i]);
        }
        state.apply_ack(7).expect("initial ack");
        assert_eq!(state.remembered_sent.len(), 3);

        let before = state.clone();
        let err = handle_resume(Some(&mut state), 42, 5).unwrap_err();
        assert_eq!(
            err,
            SessionError::WeHaveForgottenTooMany {
                our_num_sent: 10,
                our_num_remembered: 3,
                their_num_received: 5,
            }
        );
        assert_eq!(state.num_sent, before.num_sent);
        assert_eq!(state.num_acknowledged_sent, before.num_acknowledged_sent);
        assert_eq!(state.remembered_sent, before.remembered_sent);
    }

    #[test]
    fn resume_replays_unacknowledged_messages_in_order() {
        let mut state = SessionParticipantState::new(7);
        for i in 0..5u8 {
            state.on_send_payload(vec![i]);
        }
        state.apply_ack(2).expect("ack");

        let outcome = handle_resume(Some(&mut state), 7, 2).expect("resume should succeed");
        assert_eq!(
            outcome.replay,
            vec![Bytes::from_static(&[2]), Bytes::from_static(&[3]), Bytes::from_static(&[4])]
        );
    }

    #[test]
    fn resume_without_session_fails() {
        let err = handle_resume(None, 1, 0).unwrap_err();
        assert_eq!(err, SessionError::WeHaveNoSession);
    }

    #[test]
    fn resume_with_wrong_token_fails() {
        let mut state = SessionParticipantState::new(1);
        let err = handle_resume(Some(&mut state), 2, 0).unwrap_err();
        assert_eq!(err, SessionError::TokenMismatch);
    }

    #[test]
    fn ack_monotonicity_invariant_holds_across_applications() {
        let mut state = SessionParticipantState::new(1);
        for i in 0..20u8 {
            state.on_send_payload(vec![i]);
        }
        let mut last = 0;
        for ack in [2, 5, 5, 9, 15] {
            state.apply_ack(ack).expect("monotonic acks should apply");
            assert!(state.num_acknowledged_sent >= last);
            assert!(state.num_acknowledged_sent <= state.num_sent);
            last = state.num_acknowledged_sent;
        }
    }
}
