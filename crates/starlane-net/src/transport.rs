//! The steady-state I/O pump: a single cooperative task owning one stream,
//! running the handshake sub-protocol then the read/write loop (§4.8).
//!
//! `Message` payload bytes are opaque here: serializing/deserializing the
//! application protocol (including recognizing `ClientHello`/`ServerHello`)
//! is the caller's job, per §1's out-of-scope boundary. This layer only
//! frames bytes, times operations, and surfaces events.

#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

use std::{
    io,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use starlane_core::{
    config::ClientConfig,
    env::Environment,
    ping::{self, PingTracker},
};
use starlane_proto::{
    Compression, PACKET_HEADER_SIZE, PROTOCOL_HEADER_SIZE, PacketHeader, PacketType,
    parse_protocol_header,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf},
    net::TcpStream,
    sync::{mpsc, oneshot},
};
use tokio_rustls::client::TlsStream;
use tokio_util::sync::CancellationToken;

use crate::{
    dialer::{ChosenProtocol, TcpDialer},
    error::TransportError,
    events::{TransportEvent, TransportInfo},
    poll_set::{self, PollOutcome},
    read_buffer::{DecodedFrame, ReadBuffer},
    tls,
    write_queue::{OutgoingItem, WriteQueue, WriteQueueError},
};

/// Cap, in bytes, on how much write-queue data is batched into a single pump
/// write (§4.8.3).
const WRITE_BATCH_CAP: usize = 2 * 1024;

/// A periodic tick ensuring the pump re-evaluates its watchdog heartbeat even
/// when nothing else is pending (§4.8.2 step 9).
const SAFETY_TICK: Duration = Duration::from_secs(5);

/// Which address family and hostname the happy-eyeballs race actually
/// connected to, reported once alongside the `ServerHello` (scenario S1).
#[derive(Debug, Clone)]
pub struct HandshakeReport {
    /// The hostname the winning dial attempt was made against.
    pub chosen_hostname: String,
    /// The address family that won the race.
    pub chosen_protocol: ChosenProtocol,
}

/// A connected byte stream, TLS-wrapped or not, unified so the handshake and
/// pump loop don't need to care which.
enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Caller-facing handle to a running pump task. Dropping this does not stop
/// the pump; call [`TransportHandle::dispose`] explicitly (§4.8).
pub struct TransportHandle<E: Environment> {
    queue: Arc<WriteQueue>,
    ping_tracker: Arc<Mutex<PingTracker<E>>>,
    cancel: CancellationToken,
}

impl<E: Environment> TransportHandle<E> {
    /// Enqueue an application payload for transmission.
    ///
    /// # Errors
    ///
    /// See [`WriteQueue::enqueue_message`].
    pub fn enqueue_send(&self, payload: &[u8]) -> Result<usize, WriteQueueError> {
        self.queue.enqueue_message(payload)
    }

    /// Enqueue a close; the pump terminates once it dequeues this.
    ///
    /// # Errors
    ///
    /// See [`WriteQueue::enqueue_close`].
    pub fn enqueue_close(&self, payload: Vec<u8>) -> Result<(), WriteQueueError> {
        self.queue.enqueue_close(payload)
    }

    /// Enqueue a write fence, resolved once every item enqueued before it has
    /// hit the wire.
    ///
    /// # Errors
    ///
    /// See [`WriteQueue::enqueue_fence`].
    pub fn enqueue_write_fence(&self) -> Result<oneshot::Receiver<()>, WriteQueueError> {
        self.queue.enqueue_fence()
    }

    /// Enqueue a side-band info event to surface in write order.
    ///
    /// # Errors
    ///
    /// See [`WriteQueue::enqueue_info`].
    pub fn enqueue_info(&self, info: TransportInfo) -> Result<(), WriteQueueError> {
        self.queue.enqueue_info(info)
    }

    /// Enqueue an 8-byte latency-sample ping, returning its id so the caller
    /// can correlate the eventual [`TransportInfo::LatencySample`].
    ///
    /// # Errors
    ///
    /// See [`WriteQueue::enqueue_latency_sample_ping64`].
    pub fn enqueue_latency_sample(&self) -> Result<u32, WriteQueueError> {
        let sample_id = self.ping_tracker.lock().expect("ping tracker lock poisoned").allocate_sample_id();
        self.queue.enqueue_latency_sample_ping64(sample_id, ping::encode_latency_ping(sample_id))?;
        Ok(sample_id)
    }

    /// Toggle deflate compression for subsequently enqueued messages (driven
    /// by the caller after it recognizes a `ClientHelloAccepted` enabling
    /// compression; this layer never inspects message contents itself).
    pub fn set_compression_enabled(&self, enabled: bool) {
        self.queue.set_compression_enabled(enabled);
    }

    /// Cancel the pump. It exits without emitting a [`TransportEvent::Stopped`]
    /// carrying an error (§4.8, §5).
    pub fn dispose(&self) {
        self.cancel.cancel();
    }
}

/// What [`connect`] produces: a running pump plus what the handshake learned.
pub struct Connected<E: Environment> {
    /// Handle for enqueuing sends and disposing the pump.
    pub handle: TransportHandle<E>,
    /// Events surfaced by the pump, in order.
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
    /// The server's hello payload, opaque to this layer.
    pub server_hello: Bytes,
    /// Which address/hostname the handshake actually used.
    pub report: HandshakeReport,
}

/// Dial `host`, optionally TLS-wrap, and perform the handshake (§4.8.1),
/// then spawn the steady-state pump. Addresses are resolved internally
/// through a [`TcpDialer`]-owned [`crate::DnsCache`], raced happy-eyeballs
/// style between IPv4 and IPv6 (§4.6).
///
/// `client_hello` is the already-serialized `ClientHello` message; this layer
/// only frames and transmits it.
///
/// # Errors
///
/// Returns [`TransportError::ConnectTimeout`] if dialing and TLS together
/// exceed `config.connect_timeout`, [`TransportError::HeaderTimeout`] /
/// [`TransportError::ReadTimeout`] if the subsequent reads overrun their
/// budgets, [`TransportError::ProtocolStatus`] if the server's status does
/// not permit the handshake to proceed, or [`TransportError::MissingHello`]
/// if the framed reply is not a plain, uncompressed message.
pub async fn connect<E: Environment>(
    env: E,
    config: Arc<ClientConfig>,
    host: &str,
    port: u16,
    use_tls: bool,
    client_hello: &[u8],
    cancel: CancellationToken,
) -> Result<Connected<E>, TransportError> {
    let dialer = TcpDialer::with_head_start(env.clone(), config.ipv4_head_start);
    let dial_outcome = tokio::time::timeout(config.connect_timeout, dialer.connect(host, port))
        .await
        .map_err(|_elapsed| TransportError::ConnectTimeout(config.connect_timeout))??;
    let chosen_protocol = dial_outcome.chosen_protocol();

    let mut stream = if use_tls {
        let tls_stream = tokio::time::timeout(config.connect_timeout, tls::attach(dial_outcome.stream, host, &cancel))
            .await
            .map_err(|_elapsed| TransportError::ConnectTimeout(config.connect_timeout))??;
        MaybeTlsStream::Tls(Box::new(tls_stream))
    } else {
        MaybeTlsStream::Plain(dial_outcome.stream)
    };

    stream
        .write_all(client_hello)
        .await
        .map_err(|source| TransportError::StreamIoFailed { op: "write", source })?;

    let mut protocol_header_buf = [0u8; PROTOCOL_HEADER_SIZE];
    tokio::time::timeout(config.header_read_timeout, stream.read_exact(&mut protocol_header_buf))
        .await
        .map_err(|_elapsed| TransportError::HeaderTimeout(config.header_read_timeout))?
        .map_err(|source| TransportError::StreamIoFailed { op: "read", source })?;
    let protocol_header = parse_protocol_header(&protocol_header_buf, config.game_magic)?;
    if !protocol_header.status.permits_handshake() {
        return Err(TransportError::ProtocolStatus { status: protocol_header.status });
    }

    let mut packet_header_buf = [0u8; PACKET_HEADER_SIZE];
    tokio::time::timeout(config.read_timeout, stream.read_exact(&mut packet_header_buf))
        .await
        .map_err(|_elapsed| TransportError::ReadTimeout(config.read_timeout))?
        .map_err(|source| TransportError::StreamIoFailed { op: "read", source })?;
    let packet_header = PacketHeader::decode(&packet_header_buf, true)?;
    if packet_header.kind != PacketType::Message || packet_header.compression != Compression::None {
        return Err(TransportError::MissingHello);
    }

    let mut hello_payload = vec![0u8; packet_header.payload_size as usize];
    tokio::time::timeout(config.read_timeout, stream.read_exact(&mut hello_payload))
        .await
        .map_err(|_elapsed| TransportError::ReadTimeout(config.read_timeout))?
        .map_err(|source| TransportError::StreamIoFailed { op: "read", source })?;

    let server_hello = Bytes::from(hello_payload);
    let report = HandshakeReport { chosen_hostname: host.to_string(), chosen_protocol };

    let queue = Arc::new(WriteQueue::new());
    let ping_tracker = Arc::new(Mutex::new(PingTracker::new()));
    let (events_tx, events_rx) = mpsc::unbounded_channel();

    let pump = Pump {
        env,
        config,
        queue: Arc::clone(&queue),
        ping_tracker: Arc::clone(&ping_tracker),
        cancel: cancel.clone(),
        events: events_tx,
    };
    tokio::spawn(pump.run(stream));

    Ok(Connected { handle: TransportHandle { queue, ping_tracker, cancel }, events: events_rx, server_hello, report })
}

struct Pump<E: Environment> {
    env: E,
    config: Arc<ClientConfig>,
    queue: Arc<WriteQueue>,
    ping_tracker: Arc<Mutex<PingTracker<E>>>,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<TransportEvent>,
}

/// Result of one write-pumping pass (§4.8.3).
enum WritePumpOutcome {
    /// The queue had nothing ready to batch.
    Nothing,
    /// A batch of framed bytes ready to write.
    Batch(Vec<u8>),
    /// The caller enqueued a close; the pump must terminate.
    Close(Vec<u8>),
}

/// Drain the write queue into a single send buffer capped at
/// [`WRITE_BATCH_CAP`], executing non-data markers inline until the batch
/// already has bytes in it, matching §4.8.3 exactly.
fn pump_write_queue<E: Environment>(
    queue: &WriteQueue,
    ping_tracker: &Mutex<PingTracker<E>>,
    env: &E,
    events: &mpsc::UnboundedSender<TransportEvent>,
) -> WritePumpOutcome {
    let mut buffer = Vec::new();

    loop {
        let Some(item) = queue.try_acquire_next() else { break };

        match item {
            OutgoingItem::Data(data) => {
                if !buffer.is_empty() && buffer.len() + data.len() > WRITE_BATCH_CAP {
                    queue.return_acquired();
                    break;
                }
                if let Some(sample_id) = data.latency_sample_id() {
                    ping_tracker.lock().expect("ping tracker lock poisoned").record_sent(sample_id, env.now());
                }
                buffer.extend_from_slice(&data.to_vec());
                queue.release_acquired();
                if buffer.len() >= WRITE_BATCH_CAP {
                    break;
                }
            }
            OutgoingItem::Fence(()) => {
                if !buffer.is_empty() {
                    queue.return_acquired();
                    break;
                }
                queue.release_acquired();
            }
            OutgoingItem::Info(info) => {
                if !buffer.is_empty() {
                    queue.return_acquired();
                    break;
                }
                queue.release_acquired();
                let _ = events.send(TransportEvent::Info(info));
            }
            OutgoingItem::Close(payload) => {
                if !buffer.is_empty() {
                    queue.return_acquired();
                    break;
                }
                queue.release_acquired();
                return WritePumpOutcome::Close(payload);
            }
        }
    }

    if buffer.is_empty() { WritePumpOutcome::Nothing } else { WritePumpOutcome::Batch(buffer) }
}

impl<E: Environment> Pump<E> {
    async fn run(self, stream: MaybeTlsStream) {
        let (mut read_half, mut write_half) = tokio::io::split(stream);
        let mut read_buffer = ReadBuffer::new();

        let mut active_write: Option<Vec<u8>> = None;
        let mut active_read = false;

        let mut read_timeout_at: Option<E::Instant> = None;
        let mut write_timeout_at: Option<E::Instant> = None;
        let mut read_warn_at: Option<E::Instant> = None;
        let mut write_warn_at: Option<E::Instant> = None;
        let mut read_warn_active = false;
        let mut write_warn_active = false;
        let mut read_keepalive_at = self.env.now() + self.config.read_keepalive;
        let mut write_keepalive_at = self.env.now() + self.config.write_keepalive;

        let terminal: Option<TransportError> = 'pump: loop {
            let _ = self.events.send(TransportEvent::Info(TransportInfo::ThreadCycleUpdate));

            if self.cancel.is_cancelled() {
                break None;
            }

            let now = self.env.now();
            if read_timeout_at.is_some_and(|at| now >= at) {
                break Some(TransportError::ReadTimeout(self.config.read_timeout));
            }
            if write_timeout_at.is_some_and(|at| now >= at) {
                break Some(TransportError::WriteTimeout(self.config.write_timeout));
            }

            if active_write.is_none() {
                match pump_write_queue(&self.queue, &self.ping_tracker, &self.env, &self.events) {
                    WritePumpOutcome::Nothing => {}
                    WritePumpOutcome::Batch(batch) => {
                        active_write = Some(batch);
                        write_timeout_at = Some(now + self.config.write_timeout);
                        write_warn_at = Some(now + self.config.warn_after_write);
                    }
                    WritePumpOutcome::Close(payload) => break 'pump Some(TransportError::EnqueuedClose { payload }),
                }
            }

            if !active_read {
                active_read = true;
                read_timeout_at = Some(now + self.config.read_timeout);
                read_warn_at = Some(now + self.config.warn_after_read);
            }

            if now >= write_keepalive_at && active_write.is_none() {
                if let Err(err) = self.queue.enqueue_ping32(0) {
                    break 'pump Some(TransportError::WriteQueue(err));
                }
                write_keepalive_at = now + self.config.write_keepalive;
            }
            if now >= read_keepalive_at {
                if let Err(err) = self.queue.enqueue_ping32(0) {
                    break 'pump Some(TransportError::WriteQueue(err));
                }
                read_keepalive_at = now + self.config.read_keepalive;
                if active_write.is_none() {
                    write_keepalive_at = now + self.config.write_keepalive;
                }
            }

            if write_warn_at.is_some_and(|at| now >= at) && !write_warn_active {
                write_warn_active = true;
                let _ = self.events.send(TransportEvent::Info(TransportInfo::WriteDurationWarningBegin));
            }
            if read_warn_at.is_some_and(|at| now >= at) && !read_warn_active {
                read_warn_active = true;
                let _ = self.events.send(TransportEvent::Info(TransportInfo::ReadDurationWarningBegin));
            }

            let mut read_result: Option<io::Result<usize>> = None;
            let mut write_result: Option<io::Result<usize>> = None;

            let readable = async {
                if active_read {
                    let slot = read_buffer.begin_receive();
                    read_result = Some(read_half.read(slot).await);
                } else {
                    std::future::pending::<()>().await;
                }
            };
            let write_ready = async {
                if let Some(buffer) = active_write.as_deref() {
                    write_result = Some(write_half.write(buffer).await);
                } else {
                    // No write in flight: wake as soon as the queue has
                    // something new rather than waiting on the next
                    // deadline, per the PollSet wake sources (§4.4/§4.8.2
                    // step 9). `write_result` stays `None`, so the match
                    // below just loops back around to re-pump the queue.
                    self.queue.next_available().await;
                }
            };

            let nearest_deadline =
                [read_timeout_at, write_timeout_at, Some(now + SAFETY_TICK)].into_iter().flatten().min();

            let outcome = poll_set::wait(&self.env, readable, write_ready, &self.cancel, nearest_deadline).await;

            match outcome {
                PollOutcome::Cancelled => break 'pump None,
                PollOutcome::DeadlineElapsed => {}
                PollOutcome::WriteReady => {
                    let Some(result) = write_result else { continue };
                    match result {
                        Ok(written) => {
                            let now = self.env.now();
                            let Some(buffer) = active_write.as_mut() else { continue };
                            if written >= buffer.len() {
                                active_write = None;
                                write_timeout_at = None;
                                write_warn_at = None;
                                write_keepalive_at = now + self.config.write_keepalive;
                                if write_warn_active {
                                    write_warn_active = false;
                                    let _ =
                                        self.events.send(TransportEvent::Info(TransportInfo::WriteDurationWarningEnd));
                                }
                            } else {
                                buffer.drain(..written);
                            }
                        }
                        Err(source) => break 'pump Some(TransportError::StreamIoFailed { op: "write", source }),
                    }
                }
                PollOutcome::Readable => {
                    let Some(result) = read_result else { continue };
                    match result {
                        Ok(0) => break 'pump Some(TransportError::StreamClosed),
                        Ok(n) => {
                            let now = self.env.now();
                            read_buffer.end_receive(n);
                            active_read = false;
                            read_timeout_at = None;
                            read_warn_at = None;
                            read_keepalive_at = now + self.config.read_keepalive;
                            if read_warn_active {
                                read_warn_active = false;
                                let _ =
                                    self.events.send(TransportEvent::Info(TransportInfo::ReadDurationWarningEnd));
                            }

                            loop {
                                match read_buffer.try_read_next() {
                                    Ok(Some(frame)) => self.dispatch_frame(frame),
                                    Ok(None) => break,
                                    Err(err) => break 'pump Some(TransportError::WireFormat(err)),
                                }
                            }
                        }
                        Err(source) => break 'pump Some(TransportError::StreamIoFailed { op: "read", source }),
                    }
                }
            }
        };

        tracing::debug!(?terminal, "stream transport pump exiting");

        self.cancel.cancel();
        self.queue.dispose();
        let _ = tokio::time::timeout(Duration::from_secs(1), write_half.shutdown()).await;
        drop(read_half);

        let _ = self.events.send(TransportEvent::Stopped(terminal));
    }

    /// Handle one decoded frame (§4.8.4). Unknown packet types never reach
    /// here: [`ReadBuffer::try_read_next`] already rejects them.
    fn dispatch_frame(&self, frame: DecodedFrame) {
        match frame {
            DecodedFrame::Message(payload) => {
                let _ = self.events.send(TransportEvent::Received(Bytes::from(payload)));
            }
            DecodedFrame::Ping(payload) => {
                if let Err(err) = self.queue.enqueue_pong(&payload) {
                    tracing::warn!(%err, "failed to enqueue pong reply");
                }
            }
            DecodedFrame::PingResponse(payload) => {
                let Ok(bytes) = <[u8; 8]>::try_from(payload.as_slice()) else { return };
                let sample = self.ping_tracker.lock().expect("ping tracker lock poisoned").on_pong(&bytes);
                if let Some(sample) = sample {
                    let round_trip_millis =
                        u64::try_from((self.env.now() - sample.sent_at).as_millis()).unwrap_or(u64::MAX);
                    let _ = self.events.send(TransportEvent::Info(TransportInfo::LatencySample {
                        sample_id: sample.sample_id,
                        round_trip_millis,
                    }));
                }
            }
        }
    }
}
