//! Thread-safe ordered outbound queue, shared between producer tasks calling
//! `enqueue_*` and the single consumer task pumping the wire (§4.3).
//!
//! Outgoing bytes are batched into pooled buffers: an item's serialized bytes
//! are appended to the queue's current tail buffer when there's room, or a
//! fresh buffer is rented from the pool otherwise. Buffers return to the pool
//! once their last referencing item has been consumed, avoiding per-message
//! allocation under steady load.

#![allow(clippy::expect_used, reason = "Mutex poisoning should cause a panic")]

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

use starlane_proto::{CodecError, PacketType, encode_frame};
use thiserror::Error;
use tokio::sync::{Notify, oneshot};

use crate::events::TransportInfo;

/// Minimum capacity a freshly rented pooled buffer is given.
const MIN_POOLED_BUFFER: usize = 4096;

/// Errors enqueuing onto a [`WriteQueue`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WriteQueueError {
    /// A close has already been enqueued; no further items are accepted.
    #[error("write queue is closed")]
    CloseEnqueued,

    /// The queue has been disposed; no further items are accepted.
    #[error("write queue is disposed")]
    Disposed,

    /// The payload failed to encode onto the wire.
    #[error("failed to encode outgoing frame: {0}")]
    Codec(#[from] CodecError),
}

/// A buffer rented from the pool and shared by the items whose serialized
/// bytes it holds.
#[derive(Debug)]
struct BufferSlab {
    data: Vec<u8>,
}

type SlabRef = Arc<Mutex<BufferSlab>>;

/// A contiguous span of bytes inside a pooled buffer, owned by one queue item.
#[derive(Debug, Clone)]
pub struct SendBufferRef {
    buffer: SlabRef,
    start: usize,
    length: usize,
    /// Whether this is the last item referencing `buffer`; when true, the
    /// consumer returns the buffer to the pool after sending these bytes.
    is_last_ref: bool,
    /// Set when this item is a latency-sample ping: the id the pump must
    /// hand to `PingTracker::record_sent` at the moment these bytes are
    /// actually appended to the outgoing wire buffer (§4.8.3).
    latency_sample_id: Option<u32>,
}

impl SendBufferRef {
    /// Copy this span's bytes out, for handing to the wire writer.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        let slab = self.buffer.lock().expect("write queue buffer lock poisoned");
        slab.data[self.start..self.start + self.length].to_vec()
    }

    /// Length in bytes of this span.
    #[must_use]
    pub fn len(&self) -> usize {
        self.length
    }

    /// Whether this span is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// The latency-sample id this item carries, if it is a latency-sample
    /// ping rather than an ordinary data item.
    #[must_use]
    pub fn latency_sample_id(&self) -> Option<u32> {
        self.latency_sample_id
    }
}

#[derive(Debug)]
struct BufferPool {
    free: Vec<Vec<u8>>,
}

impl BufferPool {
    fn rent(&mut self, min_capacity: usize) -> SlabRef {
        let mut data = self.free.pop().unwrap_or_default();
        data.clear();
        data.reserve(min_capacity.max(MIN_POOLED_BUFFER));
        Arc::new(Mutex::new(BufferSlab { data }))
    }

    fn try_return(&mut self, buffer: SlabRef) {
        if let Ok(slab) = Arc::try_unwrap(buffer) {
            let mut data = slab.into_inner().expect("no other owners after try_unwrap");
            data.clear();
            self.free.push(data);
        }
    }
}

/// One item awaiting transmission.
#[derive(Debug, Clone)]
pub enum OutgoingItem {
    /// Framed bytes ready to write to the wire (message, ping, pong, or
    /// latency-sample ping).
    Data(SendBufferRef),
    /// A synchronization point: completed once every item enqueued before it
    /// has been written to the wire (not merely acknowledged by the peer).
    Fence(#[allow(dead_code)] ()),
    /// A side-band event to surface to the caller at this point in the write
    /// order, in-order relative to the data items around it.
    Info(TransportInfo),
    /// The caller's requested close; the pump stops after writing any bytes
    /// and surfacing this.
    Close(Vec<u8>),
}

struct Inner {
    items: VecDeque<OutgoingItem>,
    fences: VecDeque<oneshot::Sender<()>>,
    pool: BufferPool,
    tail: Option<SlabRef>,
    tail_len: usize,
    closed: bool,
    disposed: bool,
    acquired: Option<OutgoingItem>,
    compression_enabled: bool,
}

/// Ordered, thread-safe outbound queue feeding the [`crate::transport::StreamTransport`]
/// write pump.
pub struct WriteQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl Default for WriteQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WriteQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                fences: VecDeque::new(),
                pool: BufferPool { free: Vec::new() },
                tail: None,
                tail_len: 0,
                closed: false,
                disposed: false,
                acquired: None,
                compression_enabled: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Enable or disable deflate compression for subsequently enqueued
    /// message payloads.
    pub fn set_compression_enabled(&self, enabled: bool) {
        self.inner.lock().expect("write queue lock poisoned").compression_enabled = enabled;
    }

    /// Enqueue an application payload. Returns the number of bytes appended
    /// to the wire (header plus, possibly compressed, payload).
    ///
    /// # Errors
    ///
    /// [`WriteQueueError::CloseEnqueued`] or [`WriteQueueError::Disposed`] if
    /// the queue no longer accepts writes, or [`WriteQueueError::Codec`] if
    /// the payload exceeds a size cap.
    pub fn enqueue_message(&self, payload: &[u8]) -> Result<usize, WriteQueueError> {
        let mut inner = self.inner.lock().expect("write queue lock poisoned");
        let compression_enabled = inner.compression_enabled;
        let wire = encode_frame(PacketType::Message, payload, compression_enabled)?;
        let len = wire.len();
        Self::push_data(&mut inner, &wire, None);
        drop(inner);
        self.notify.notify_one();
        Ok(len)
    }

    /// Enqueue a 4-byte keep-alive ping payload.
    ///
    /// # Errors
    ///
    /// See [`WriteQueue::enqueue_message`].
    pub fn enqueue_ping32(&self, payload: u32) -> Result<(), WriteQueueError> {
        self.enqueue_raw(PacketType::Ping, &payload.to_le_bytes())
    }

    /// Enqueue a pong reply mirroring an observed ping payload.
    ///
    /// # Errors
    ///
    /// See [`WriteQueue::enqueue_message`].
    pub fn enqueue_pong(&self, payload: &[u8]) -> Result<(), WriteQueueError> {
        self.enqueue_raw(PacketType::PingResponse, payload)
    }

    /// Enqueue an 8-byte latency-sample ping, tagging the queued item with
    /// `sample_id` so the pump can timestamp the actual send (§4.8.3).
    ///
    /// # Errors
    ///
    /// See [`WriteQueue::enqueue_message`].
    pub fn enqueue_latency_sample_ping64(
        &self,
        sample_id: u32,
        ping_payload: [u8; 8],
    ) -> Result<(), WriteQueueError> {
        let mut inner = self.inner.lock().expect("write queue lock poisoned");
        let wire = encode_frame(PacketType::Ping, &ping_payload, false)?;
        Self::push_data(&mut inner, &wire, Some(sample_id));
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    fn enqueue_raw(&self, kind: PacketType, payload: &[u8]) -> Result<(), WriteQueueError> {
        let mut inner = self.inner.lock().expect("write queue lock poisoned");
        let wire = encode_frame(kind, payload, false)?;
        Self::push_data(&mut inner, &wire, None);
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    fn push_data(inner: &mut Inner, wire: &[u8], latency_sample_id: Option<u32>) {
        if inner.closed || inner.disposed {
            return;
        }
        let slab = Self::tail_slab(inner, wire.len());
        let start;
        {
            let mut guard = slab.lock().expect("write queue buffer lock poisoned");
            start = guard.data.len();
            guard.data.extend_from_slice(wire);
        }
        inner.tail_len = start + wire.len();
        // Not the last reference yet: sealed (if ever) by a later `seal_tail`
        // call, once a subsequent push no longer fits in this buffer.
        inner.items.push_back(OutgoingItem::Data(SendBufferRef {
            buffer: slab,
            start,
            length: wire.len(),
            is_last_ref: false,
            latency_sample_id,
        }));
    }

    /// Return the current tail buffer if `additional` more bytes still fit
    /// within its rented capacity, otherwise seal it (marking the last item
    /// referencing it as the final reference) and rent a fresh one.
    fn tail_slab(inner: &mut Inner, additional: usize) -> SlabRef {
        if let Some(tail) = &inner.tail {
            let capacity = guess_capacity(tail);
            if inner.tail_len + additional <= capacity {
                return Arc::clone(tail);
            }
            Self::seal_tail(inner);
        }
        let fresh = inner.pool.rent(additional);
        inner.tail = Some(Arc::clone(&fresh));
        inner.tail_len = 0;
        fresh
    }

    fn seal_tail(inner: &mut Inner) {
        if let Some(last_data) =
            inner.items.iter_mut().rev().find_map(|item| match item {
                OutgoingItem::Data(data) if inner.tail.as_ref().is_some_and(|t| Arc::ptr_eq(t, &data.buffer)) => {
                    Some(data)
                }
                _ => None,
            })
        {
            last_data.is_last_ref = true;
        }
        inner.tail = None;
        inner.tail_len = 0;
    }

    /// Enqueue a synchronization fence; the returned receiver resolves once
    /// every item enqueued before the fence has been written to the wire.
    ///
    /// # Errors
    ///
    /// [`WriteQueueError::CloseEnqueued`] or [`WriteQueueError::Disposed`].
    pub fn enqueue_fence(&self) -> Result<oneshot::Receiver<()>, WriteQueueError> {
        let mut inner = self.inner.lock().expect("write queue lock poisoned");
        if inner.closed {
            return Err(WriteQueueError::CloseEnqueued);
        }
        if inner.disposed {
            return Err(WriteQueueError::Disposed);
        }
        let (tx, rx) = oneshot::channel();
        inner.fences.push_back(tx);
        inner.items.push_back(OutgoingItem::Fence(()));
        drop(inner);
        self.notify.notify_one();
        Ok(rx)
    }

    /// Enqueue a side-band info event to be surfaced in write order.
    ///
    /// # Errors
    ///
    /// [`WriteQueueError::CloseEnqueued`] or [`WriteQueueError::Disposed`].
    pub fn enqueue_info(&self, info: TransportInfo) -> Result<(), WriteQueueError> {
        let mut inner = self.inner.lock().expect("write queue lock poisoned");
        if inner.closed {
            return Err(WriteQueueError::CloseEnqueued);
        }
        if inner.disposed {
            return Err(WriteQueueError::Disposed);
        }
        inner.items.push_back(OutgoingItem::Info(info));
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    /// Enqueue a close with the given payload, setting the closed flag. No
    /// further items are accepted after this call.
    ///
    /// # Errors
    ///
    /// [`WriteQueueError::CloseEnqueued`] if a close is already enqueued, or
    /// [`WriteQueueError::Disposed`].
    pub fn enqueue_close(&self, payload: Vec<u8>) -> Result<(), WriteQueueError> {
        let mut inner = self.inner.lock().expect("write queue lock poisoned");
        if inner.closed {
            return Err(WriteQueueError::CloseEnqueued);
        }
        if inner.disposed {
            return Err(WriteQueueError::Disposed);
        }
        inner.closed = true;
        inner.items.push_back(OutgoingItem::Close(payload));
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    /// Resolve once an item is available to acquire, or immediately if one
    /// already is.
    pub async fn next_available(&self) {
        loop {
            if !self.inner.lock().expect("write queue lock poisoned").items.is_empty() {
                return;
            }
            self.notify.notified().await;
        }
    }

    /// Take the next item off the queue for the single consumer to send,
    /// without removing fence bookkeeping (resolved on release).
    pub fn try_acquire_next(&self) -> Option<OutgoingItem> {
        let mut inner = self.inner.lock().expect("write queue lock poisoned");
        if inner.acquired.is_some() {
            return None;
        }
        let item = inner.items.pop_front()?;
        inner.acquired = Some(item.clone());
        Some(item)
    }

    /// Release the currently acquired item after it has been fully written,
    /// completing any fence it represents.
    pub fn release_acquired(&self) {
        let mut inner = self.inner.lock().expect("write queue lock poisoned");
        let Some(item) = inner.acquired.take() else { return };
        match item {
            OutgoingItem::Data(data) if data.is_last_ref => {
                inner.pool.try_return(data.buffer);
            }
            OutgoingItem::Fence(()) => {
                if let Some(tx) = inner.fences.pop_front() {
                    let _ = tx.send(());
                }
            }
            _ => {}
        }
    }

    /// Return the currently acquired item to the front of the queue
    /// unsent, for a consumer that could not complete the write (e.g. the
    /// wire was torn down mid-attempt).
    pub fn return_acquired(&self) {
        let mut inner = self.inner.lock().expect("write queue lock poisoned");
        if let Some(item) = inner.acquired.take() {
            inner.items.push_front(item);
        }
    }

    /// Permanently dispose of the queue: drop every unacquired item,
    /// returning their buffers to the pool, and reject all future enqueues.
    /// An item the consumer currently has acquired is left alone; its
    /// buffer returns to the pool when the consumer later releases it.
    pub fn dispose(&self) {
        let mut inner = self.inner.lock().expect("write queue lock poisoned");
        inner.disposed = true;
        inner.fences.clear();
        while let Some(item) = inner.items.pop_front() {
            if let OutgoingItem::Data(data) = item {
                if data.is_last_ref {
                    inner.pool.try_return(data.buffer);
                }
            }
        }
        inner.tail = None;
        inner.tail_len = 0;
    }

    /// Whether a close has been enqueued.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().expect("write queue lock poisoned").closed
    }
}

/// Best-effort capacity read for a slab, used only to decide whether more
/// bytes still fit in the current tail buffer.
fn guess_capacity(slab: &SlabRef) -> usize {
    slab.lock().expect("write queue buffer lock poisoned").data.capacity()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_message_returns_wire_length() {
        let q = WriteQueue::new();
        let n = q.enqueue_message(b"hi").unwrap();
        assert_eq!(n, 4 + 2);
    }

    #[test]
    fn items_are_delivered_fifo() {
        let q = WriteQueue::new();
        q.enqueue_message(b"one").unwrap();
        q.enqueue_message(b"two").unwrap();
        let OutgoingItem::Data(a) = q.try_acquire_next().unwrap() else { panic!() };
        assert_eq!(&a.to_vec()[4..], b"one");
        q.release_acquired();
        let OutgoingItem::Data(b) = q.try_acquire_next().unwrap() else { panic!() };
        assert_eq!(&b.to_vec()[4..], b"two");
    }

    #[test]
    fn only_one_item_may_be_acquired_at_a_time() {
        let q = WriteQueue::new();
        q.enqueue_message(b"one").unwrap();
        q.enqueue_message(b"two").unwrap();
        assert!(q.try_acquire_next().is_some());
        assert!(q.try_acquire_next().is_none(), "second acquire must wait for release");
    }

    #[test]
    fn return_acquired_puts_item_back_at_the_front() {
        let q = WriteQueue::new();
        q.enqueue_message(b"one").unwrap();
        q.enqueue_message(b"two").unwrap();
        let first = q.try_acquire_next().unwrap();
        q.return_acquired();
        let reacquired = q.try_acquire_next().unwrap();
        let OutgoingItem::Data(a) = &first else { panic!() };
        let OutgoingItem::Data(b) = &reacquired else { panic!() };
        assert_eq!(a.to_vec(), b.to_vec());
    }

    #[test]
    fn enqueue_after_close_is_rejected() {
        let q = WriteQueue::new();
        q.enqueue_close(vec![]).unwrap();
        let err = q.enqueue_message(b"late").unwrap_err();
        assert_eq!(err, WriteQueueError::CloseEnqueued);
    }

    #[test]
    fn double_close_is_rejected() {
        let q = WriteQueue::new();
        q.enqueue_close(vec![]).unwrap();
        let err = q.enqueue_close(vec![]).unwrap_err();
        assert_eq!(err, WriteQueueError::CloseEnqueued);
    }

    #[test]
    fn enqueue_after_dispose_is_rejected() {
        let q = WriteQueue::new();
        q.dispose();
        let err = q.enqueue_message(b"late").unwrap_err();
        assert_eq!(err, WriteQueueError::Disposed);
    }

    #[test]
    fn fence_resolves_once_released() {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let q = WriteQueue::new();
            q.enqueue_message(b"one").unwrap();
            let fence = q.enqueue_fence().unwrap();

            let _data = q.try_acquire_next().unwrap();
            q.release_acquired();
            let OutgoingItem::Fence(()) = q.try_acquire_next().unwrap() else { panic!() };
            q.release_acquired();

            fence.await.expect("fence should resolve");
        });
    }

    #[test]
    fn dispose_while_item_acquired_defers_buffer_return() {
        let q = WriteQueue::new();
        q.enqueue_message(b"one").unwrap();
        let acquired = q.try_acquire_next().unwrap();
        q.dispose();
        // still safe to release after dispose; must not panic or double free.
        drop(acquired);
        q.release_acquired();
    }

    #[test]
    fn next_available_resolves_once_something_is_enqueued() {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let q = Arc::new(WriteQueue::new());
            let waiter = {
                let q = Arc::clone(&q);
                tokio::spawn(async move {
                    q.next_available().await;
                })
            };
            tokio::task::yield_now().await;
            q.enqueue_message(b"hi").unwrap();
            waiter.await.unwrap();
        });
    }
}
