//! Test-only transport middlewares (§4.11): `LatencySimMiddleware` and
//! `FaultInjectorMiddleware`. Both wrap the command/event surface a
//! `starlane_net::transport::TransportHandle` exposes rather than the pump
//! itself, so they compose in front of a real transport or a fake one
//! interchangeably. Neither is wired into production connection setup; they
//! exist for scenario tests that need to inject latency or faults a real
//! socket won't produce on demand.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use starlane_core::env::Environment;
use starlane_net::{error::TransportError, events::TransportEvent, write_queue::WriteQueueError};
use tokio::sync::{mpsc, oneshot};

/// The subset of `TransportHandle<E>`'s public API that outbound-path
/// middlewares wrap. Implemented for the real handle and for other
/// middlewares, so they compose.
pub trait CommandSink: Send + Sync {
    /// See `TransportHandle::enqueue_send`.
    fn enqueue_send(&self, payload: &[u8]) -> Result<usize, WriteQueueError>;
    /// See `TransportHandle::enqueue_close`.
    fn enqueue_close(&self, payload: Vec<u8>) -> Result<(), WriteQueueError>;
    /// See `TransportHandle::enqueue_write_fence`.
    fn enqueue_write_fence(&self) -> Result<oneshot::Receiver<()>, WriteQueueError>;
    /// See `TransportHandle::enqueue_info`.
    fn enqueue_info(&self, info: starlane_net::events::TransportInfo) -> Result<(), WriteQueueError>;
    /// See `TransportHandle::enqueue_latency_sample`.
    fn enqueue_latency_sample(&self) -> Result<u32, WriteQueueError>;
    /// See `TransportHandle::set_compression_enabled`.
    fn set_compression_enabled(&self, enabled: bool);
    /// See `TransportHandle::dispose`.
    fn dispose(&self);
}

impl<E: Environment> CommandSink for starlane_net::transport::TransportHandle<E> {
    fn enqueue_send(&self, payload: &[u8]) -> Result<usize, WriteQueueError> {
        starlane_net::transport::TransportHandle::enqueue_send(self, payload)
    }

    fn enqueue_close(&self, payload: Vec<u8>) -> Result<(), WriteQueueError> {
        starlane_net::transport::TransportHandle::enqueue_close(self, payload)
    }

    fn enqueue_write_fence(&self) -> Result<oneshot::Receiver<()>, WriteQueueError> {
        starlane_net::transport::TransportHandle::enqueue_write_fence(self)
    }

    fn enqueue_info(&self, info: starlane_net::events::TransportInfo) -> Result<(), WriteQueueError> {
        starlane_net::transport::TransportHandle::enqueue_info(self, info)
    }

    fn enqueue_latency_sample(&self) -> Result<u32, WriteQueueError> {
        starlane_net::transport::TransportHandle::enqueue_latency_sample(self)
    }

    fn set_compression_enabled(&self, enabled: bool) {
        starlane_net::transport::TransportHandle::set_compression_enabled(self, enabled);
    }

    fn dispose(&self) {
        starlane_net::transport::TransportHandle::dispose(self);
    }
}

/// Subtracts `by` from a [`TransportEvent::Info`] latency sample's implied
/// send time by re-encoding the round trip, so the synthetic one-way delay
/// this middleware adds doesn't get double-counted into the measurement the
/// caller sees (§4.11).
fn correct_latency_sample(event: TransportEvent, total_added_latency: Duration) -> TransportEvent {
    match event {
        TransportEvent::Info(starlane_net::events::TransportInfo::LatencySample {
            sample_id,
            round_trip_millis,
        }) => {
            let correction = u64::try_from(total_added_latency.as_millis()).unwrap_or(u64::MAX);
            let corrected = round_trip_millis.saturating_sub(correction);
            TransportEvent::Info(starlane_net::events::TransportInfo::LatencySample {
                sample_id,
                round_trip_millis: corrected,
            })
        }
        other => other,
    }
}

/// Wraps a transport and adds artificial one-way latency of `total / 2` to
/// both the send and receive paths.
///
/// Each direction is served by its own sequential forwarding loop (a FIFO
/// executor), so events and commands that were in order upstream stay in
/// order downstream even though each one is individually delayed; unlike the
/// abstract design, delays are not pipelined (one event fully clears its
/// delay before the next one starts), which is immaterial under a
/// [`starlane_core::env::test_utils::MockEnv`] clock where `sleep` resolves
/// instantly.
pub struct LatencySimMiddleware<E: Environment> {
    env: E,
    inner: Arc<dyn CommandSink>,
    one_way_latency: Duration,
    events_out: mpsc::UnboundedReceiver<TransportEvent>,
    receive_loop: tokio::task::JoinHandle<()>,
}

impl<E: Environment> LatencySimMiddleware<E> {
    /// Wrap `inner`, delaying events arriving on `events_in` and commands
    /// issued through [`Self::enqueue_send`] and friends by `total_latency /
    /// 2` each way.
    #[must_use]
    pub fn wrap(
        env: E,
        inner: Arc<dyn CommandSink>,
        events_in: mpsc::UnboundedReceiver<TransportEvent>,
        total_latency: Duration,
    ) -> Self {
        let one_way_latency = total_latency / 2;
        let (events_tx, events_out) = mpsc::unbounded_channel();
        let receive_loop = tokio::spawn(Self::forward_loop(env.clone(), one_way_latency, events_in, events_tx));
        Self { env, inner, one_way_latency, events_out, receive_loop }
    }

    async fn forward_loop(
        env: E,
        delay: Duration,
        mut events_in: mpsc::UnboundedReceiver<TransportEvent>,
        events_out: mpsc::UnboundedSender<TransportEvent>,
    ) {
        while let Some(event) = events_in.recv().await {
            if !delay.is_zero() {
                env.sleep(delay).await;
            }
            let event = correct_latency_sample(event, delay);
            if events_out.send(event).is_err() {
                return;
            }
        }
    }

    /// The delayed event stream; replaces the raw transport's `events`
    /// receiver in test code driving this middleware.
    pub fn events(&mut self) -> &mut mpsc::UnboundedReceiver<TransportEvent> {
        &mut self.events_out
    }
}

impl<E: Environment> Drop for LatencySimMiddleware<E> {
    fn drop(&mut self) {
        self.receive_loop.abort();
    }
}

impl<E: Environment> CommandSink for LatencySimMiddleware<E> {
    fn enqueue_send(&self, payload: &[u8]) -> Result<usize, WriteQueueError> {
        let queued_len = payload.len();
        let payload = payload.to_vec();
        let inner = Arc::clone(&self.inner);
        let env = self.env.clone();
        let delay = self.one_way_latency;
        tokio::spawn(async move {
            if !delay.is_zero() {
                env.sleep(delay).await;
            }
            let _ = inner.enqueue_send(&payload);
        });
        Ok(queued_len)
    }

    fn enqueue_close(&self, payload: Vec<u8>) -> Result<(), WriteQueueError> {
        let inner = Arc::clone(&self.inner);
        let env = self.env.clone();
        let delay = self.one_way_latency;
        tokio::spawn(async move {
            if !delay.is_zero() {
                env.sleep(delay).await;
            }
            let _ = inner.enqueue_close(payload);
        });
        Ok(())
    }

    fn enqueue_write_fence(&self) -> Result<oneshot::Receiver<()>, WriteQueueError> {
        self.inner.enqueue_write_fence()
    }

    fn enqueue_info(&self, info: starlane_net::events::TransportInfo) -> Result<(), WriteQueueError> {
        self.inner.enqueue_info(info)
    }

    fn enqueue_latency_sample(&self) -> Result<u32, WriteQueueError> {
        self.inner.enqueue_latency_sample()
    }

    fn set_compression_enabled(&self, enabled: bool) {
        self.inner.set_compression_enabled(enabled);
    }

    fn dispose(&self) {
        self.inner.dispose();
    }
}

/// When a [`FaultInjectorMiddleware::inject`] fault fires relative to the
/// call that scheduled it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultTiming {
    /// Fire as soon as the transport is open (i.e. on the very next poll of
    /// the event stream).
    Immediate,
    /// Fire asynchronously, as though the fault condition arose later in an
    /// already-open connection.
    Async,
}

enum ControlMessage {
    Inject(TransportError, FaultTiming),
    Halt,
    Resume,
}

/// Shared control surface for a running [`FaultInjectorMiddleware`]'s
/// forwarding loop; kept by test code that needs to inject faults or
/// halt/resume delivery after the middleware has been handed off.
#[derive(Clone)]
pub struct FaultInjectorHandle {
    control: mpsc::UnboundedSender<ControlMessage>,
}

impl FaultInjectorHandle {
    /// Inject `error` as a [`TransportEvent::Stopped`], either immediately or
    /// asynchronously per `timing`.
    pub fn inject(&self, error: TransportError, timing: FaultTiming) {
        tracing::debug!(?timing, %error, "scenario: injecting fault");
        let _ = self.control.send(ControlMessage::Inject(error, timing));
    }

    /// Halt delivery: subsequent upstream events and commands are buffered
    /// rather than forwarded, until [`Self::resume`] is called.
    pub fn halt(&self) {
        tracing::debug!("scenario: halting delivery");
        let _ = self.control.send(ControlMessage::Halt);
    }

    /// Resume delivery, replaying everything buffered while halted in order.
    pub fn resume(&self) {
        tracing::debug!("scenario: resuming delivery");
        let _ = self.control.send(ControlMessage::Resume);
    }
}

/// Wraps a transport to let scenario tests inject specific faults or
/// halt/resume the flow of events and commands on demand (§4.11).
///
/// This is a test-only utility: it is never constructed by production
/// connection setup, only by scenario tests driving a [`Connection`] against
/// a fake transport.
///
/// [`Connection`]: starlane_core::connection::Connection
pub struct FaultInjectorMiddleware {
    inner: Arc<dyn CommandSink>,
    control: mpsc::UnboundedSender<ControlMessage>,
    events_out: mpsc::UnboundedReceiver<TransportEvent>,
    forward_loop: tokio::task::JoinHandle<()>,
}

impl FaultInjectorMiddleware {
    /// Wrap `inner`, forwarding `events_in` to a new receiver the caller
    /// should poll instead of the original.
    #[must_use]
    pub fn wrap(inner: Arc<dyn CommandSink>, events_in: mpsc::UnboundedReceiver<TransportEvent>) -> (Self, FaultInjectorHandle) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (events_tx, events_out) = mpsc::unbounded_channel();
        let forward_loop = tokio::spawn(Self::forward_loop(events_in, events_tx, control_rx));
        let handle = FaultInjectorHandle { control: control_tx.clone() };
        (Self { inner, control: control_tx, events_out, forward_loop }, handle)
    }

    async fn forward_loop(
        mut events_in: mpsc::UnboundedReceiver<TransportEvent>,
        events_out: mpsc::UnboundedSender<TransportEvent>,
        mut control: mpsc::UnboundedReceiver<ControlMessage>,
    ) {
        let mut halted = false;
        let mut buffer: VecDeque<TransportEvent> = VecDeque::new();

        loop {
            tokio::select! {
                biased;

                control_message = control.recv() => {
                    match control_message {
                        Some(ControlMessage::Inject(error, FaultTiming::Immediate)) => {
                            let _ = events_out.send(TransportEvent::Stopped(Some(error)));
                            return;
                        }
                        Some(ControlMessage::Inject(error, FaultTiming::Async)) => {
                            if halted {
                                buffer.push_back(TransportEvent::Stopped(Some(error)));
                            } else {
                                let _ = events_out.send(TransportEvent::Stopped(Some(error)));
                                return;
                            }
                        }
                        Some(ControlMessage::Halt) => halted = true,
                        Some(ControlMessage::Resume) => {
                            halted = false;
                            while let Some(event) = buffer.pop_front() {
                                if events_out.send(event).is_err() {
                                    return;
                                }
                            }
                        }
                        None => return,
                    }
                }

                event = events_in.recv() => {
                    match event {
                        Some(event) if halted => buffer.push_back(event),
                        Some(event) => {
                            if events_out.send(event).is_err() {
                                return;
                            }
                        }
                        None => return,
                    }
                }
            }
        }
    }

    /// The event stream after fault injection and halt/resume buffering;
    /// replaces the raw transport's `events` receiver in test code.
    pub fn events(&mut self) -> &mut mpsc::UnboundedReceiver<TransportEvent> {
        &mut self.events_out
    }
}

impl Drop for FaultInjectorMiddleware {
    fn drop(&mut self) {
        self.forward_loop.abort();
    }
}

impl CommandSink for FaultInjectorMiddleware {
    fn enqueue_send(&self, payload: &[u8]) -> Result<usize, WriteQueueError> {
        self.inner.enqueue_send(payload)
    }

    fn enqueue_close(&self, payload: Vec<u8>) -> Result<(), WriteQueueError> {
        self.inner.enqueue_close(payload)
    }

    fn enqueue_write_fence(&self) -> Result<oneshot::Receiver<()>, WriteQueueError> {
        self.inner.enqueue_write_fence()
    }

    fn enqueue_info(&self, info: starlane_net::events::TransportInfo) -> Result<(), WriteQueueError> {
        self.inner.enqueue_info(info)
    }

    fn enqueue_latency_sample(&self) -> Result<u32, WriteQueueError> {
        self.inner.enqueue_latency_sample()
    }

    fn set_compression_enabled(&self, enabled: bool) {
        self.inner.set_compression_enabled(enabled);
    }

    fn dispose(&self) {
        self.inner.dispose();
    }
}

#[cfg(test)]
mod tests {
    use starlane_core::env::test_utils::MockEnv;
    use starlane_net::events::TransportInfo;

    use super::*;

    struct RecordingSink {
        sent: Mutex<Vec<Vec<u8>>>,
    }

    impl Default for RecordingSink {
        fn default() -> Self {
            Self { sent: Mutex::new(Vec::new()) }
        }
    }

    impl CommandSink for RecordingSink {
        fn enqueue_send(&self, payload: &[u8]) -> Result<usize, WriteQueueError> {
            self.sent.lock().expect("lock poisoned").push(payload.to_vec());
            Ok(payload.len())
        }
        fn enqueue_close(&self, _payload: Vec<u8>) -> Result<(), WriteQueueError> {
            Ok(())
        }
        fn enqueue_write_fence(&self) -> Result<oneshot::Receiver<()>, WriteQueueError> {
            let (tx, rx) = oneshot::channel();
            let _ = tx.send(());
            Ok(rx)
        }
        fn enqueue_info(&self, _info: TransportInfo) -> Result<(), WriteQueueError> {
            Ok(())
        }
        fn enqueue_latency_sample(&self) -> Result<u32, WriteQueueError> {
            Ok(0)
        }
        fn set_compression_enabled(&self, _enabled: bool) {}
        fn dispose(&self) {}
    }

    #[tokio::test]
    async fn latency_sim_forwards_events_in_order_after_a_delay() {
        let env = MockEnv::default();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        events_tx.send(TransportEvent::Received(bytes::Bytes::from_static(b"one"))).unwrap();
        events_tx.send(TransportEvent::Received(bytes::Bytes::from_static(b"two"))).unwrap();
        drop(events_tx);

        let inner = Arc::new(RecordingSink::default());
        let mut middleware = LatencySimMiddleware::wrap(env, inner, events_rx, Duration::from_millis(100));

        let first = middleware.events().recv().await.unwrap();
        let second = middleware.events().recv().await.unwrap();
        assert!(matches!(first, TransportEvent::Received(b) if b.as_ref() == b"one"));
        assert!(matches!(second, TransportEvent::Received(b) if b.as_ref() == b"two"));
    }

    #[tokio::test]
    async fn latency_sim_corrects_latency_sample_round_trip_by_the_added_delay() {
        let env = MockEnv::default();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        events_tx
            .send(TransportEvent::Info(TransportInfo::LatencySample { sample_id: 7, round_trip_millis: 500 }))
            .unwrap();
        drop(events_tx);

        let inner = Arc::new(RecordingSink::default());
        let mut middleware = LatencySimMiddleware::wrap(env, inner, events_rx, Duration::from_millis(100));

        let event = middleware.events().recv().await.unwrap();
        match event {
            TransportEvent::Info(TransportInfo::LatencySample { round_trip_millis, .. }) => {
                assert_eq!(round_trip_millis, 450);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn immediate_fault_injection_reports_stopped_and_ends_the_stream() {
        let (_events_tx, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(RecordingSink::default());
        let (mut middleware, handle) = FaultInjectorMiddleware::wrap(inner, events_rx);

        handle.inject(TransportError::StreamClosed, FaultTiming::Immediate);

        let event = middleware.events().recv().await.unwrap();
        assert!(matches!(event, TransportEvent::Stopped(Some(TransportError::StreamClosed))));
        assert!(middleware.events().recv().await.is_none());
    }

    #[tokio::test]
    async fn halting_buffers_events_and_resume_replays_them_in_order() {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(RecordingSink::default());
        let (mut middleware, handle) = FaultInjectorMiddleware::wrap(inner, events_rx);

        handle.halt();
        // Give the control loop a moment to apply the halt before events land.
        tokio::task::yield_now().await;
        events_tx.send(TransportEvent::Received(bytes::Bytes::from_static(b"one"))).unwrap();
        events_tx.send(TransportEvent::Received(bytes::Bytes::from_static(b"two"))).unwrap();
        tokio::task::yield_now().await;
        handle.resume();

        let first = middleware.events().recv().await.unwrap();
        let second = middleware.events().recv().await.unwrap();
        assert!(matches!(first, TransportEvent::Received(b) if b.as_ref() == b"one"));
        assert!(matches!(second, TransportEvent::Received(b) if b.as_ref() == b"two"));
    }

    #[tokio::test]
    async fn halted_commands_still_reach_the_inner_sink_directly() {
        let (_events_tx, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(RecordingSink::default());
        let (middleware, handle) = FaultInjectorMiddleware::wrap(Arc::clone(&inner) as Arc<dyn CommandSink>, events_rx);
        handle.halt();
        middleware.enqueue_send(b"ping").unwrap();
        assert_eq!(inner.sent.lock().unwrap().len(), 1);
    }
}
