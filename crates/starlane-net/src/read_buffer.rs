//! Growable receive buffer that turns raw stream bytes into decoded frames
//! (§4.2).
//!
//! The buffer grows to accommodate whatever frame size it has most recently
//! learned about (via an oversized header), compacting in place before
//! growing, and never shrinks back down: connections tend to settle into a
//! steady frame size, so holding onto the high-water mark avoids repeated
//! reallocation.

use starlane_proto::{CodecError, Compression, PACKET_HEADER_SIZE, PacketHeader, PacketType, decode_payload};

/// Buffers grow in multiples of this size.
const GROWTH_GRANULARITY: usize = 1024;

/// Initial anticipated frame size before any header has been observed.
const DEFAULT_ANTICIPATED_FRAME: usize = 4096;

/// A frame decoded off the wire by [`ReadBuffer::try_read_next`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedFrame {
    /// An application payload message, already decompressed.
    Message(Vec<u8>),
    /// A keep-alive or latency-sample ping payload, verbatim.
    Ping(Vec<u8>),
    /// A reply to one of our pings, verbatim.
    PingResponse(Vec<u8>),
}

/// A growable byte buffer that accumulates raw stream reads and yields
/// decoded frames once enough bytes have arrived.
#[derive(Debug)]
pub struct ReadBuffer {
    buf: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
    anticipated_frame_size: usize,
}

impl Default for ReadBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadBuffer {
    /// Create an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buf: vec![0u8; DEFAULT_ANTICIPATED_FRAME],
            read_pos: 0,
            write_pos: 0,
            anticipated_frame_size: DEFAULT_ANTICIPATED_FRAME,
        }
    }

    /// Borrow a writable region of at least `anticipated_frame_size` bytes,
    /// compacting or growing the backing buffer first if needed. The caller
    /// fills some prefix of the returned slice from the stream and reports
    /// how much via [`ReadBuffer::end_receive`].
    pub fn begin_receive(&mut self) -> &mut [u8] {
        self.ensure_capacity(self.anticipated_frame_size);
        &mut self.buf[self.write_pos..]
    }

    /// Record that `n` bytes were written into the slice handed out by the
    /// most recent [`ReadBuffer::begin_receive`] call.
    pub fn end_receive(&mut self, n: usize) {
        self.write_pos += n;
        debug_assert!(self.write_pos <= self.buf.len());
    }

    /// Attempt to decode the next complete frame out of the buffered bytes.
    ///
    /// Returns `Ok(None)` if fewer than a full frame's worth of bytes has
    /// arrived yet (bumping the anticipated frame size so the next
    /// [`ReadBuffer::begin_receive`] requests enough room). Returns
    /// `Err` for a malformed header, an unrecognized packet type, or a
    /// corrupt compressed payload.
    ///
    /// # Errors
    ///
    /// See [`CodecError`] for the specific failure classes.
    pub fn try_read_next(&mut self) -> Result<Option<DecodedFrame>, CodecError> {
        let available = self.write_pos - self.read_pos;
        if available < PACKET_HEADER_SIZE {
            return Ok(None);
        }

        let mut header_bytes = [0u8; PACKET_HEADER_SIZE];
        header_bytes.copy_from_slice(&self.buf[self.read_pos..self.read_pos + PACKET_HEADER_SIZE]);
        let header = PacketHeader::decode(&header_bytes, false)?;

        if header.payload_size > starlane_proto::MAX_WIRE_PAYLOAD {
            return Err(CodecError::WireMessageTooLarge {
                size: header.payload_size,
                max: starlane_proto::MAX_WIRE_PAYLOAD,
            });
        }

        let framed_size = PACKET_HEADER_SIZE + header.payload_size as usize;
        if available < framed_size {
            self.anticipated_frame_size = framed_size;
            return Ok(None);
        }

        let payload_start = self.read_pos + PACKET_HEADER_SIZE;
        let payload_end = self.read_pos + framed_size;
        let wire_payload = &self.buf[payload_start..payload_end];

        let frame = match header.kind {
            PacketType::Message => DecodedFrame::Message(decode_payload(&header, wire_payload)?),
            PacketType::Ping => {
                debug_assert_eq!(header.compression, Compression::None);
                DecodedFrame::Ping(wire_payload.to_vec())
            }
            PacketType::PingResponse => {
                debug_assert_eq!(header.compression, Compression::None);
                DecodedFrame::PingResponse(wire_payload.to_vec())
            }
            PacketType::None | PacketType::HealthCheck => {
                return Err(CodecError::UnknownPacketType(header.kind as u8));
            }
        };

        self.read_pos += framed_size;
        if self.read_pos == self.write_pos {
            self.read_pos = 0;
            self.write_pos = 0;
        }

        Ok(Some(frame))
    }

    /// Ensure at least `min_writable` bytes are available past `write_pos`,
    /// compacting the unread tail to the front first, then growing the
    /// backing `Vec` to the next multiple of [`GROWTH_GRANULARITY`] if
    /// compaction alone isn't enough.
    fn ensure_capacity(&mut self, min_writable: usize) {
        if self.buf.len() - self.write_pos >= min_writable {
            return;
        }

        if self.read_pos > 0 {
            self.buf.copy_within(self.read_pos..self.write_pos, 0);
            self.write_pos -= self.read_pos;
            self.read_pos = 0;
        }

        if self.buf.len() - self.write_pos >= min_writable {
            return;
        }

        let required = self.write_pos + min_writable;
        let new_len = required.div_ceil(GROWTH_GRANULARITY) * GROWTH_GRANULARITY;
        self.buf.resize(new_len, 0);
    }
}

#[cfg(test)]
mod tests {
    use starlane_proto::encode_frame;

    use super::*;

    fn push(rb: &mut ReadBuffer, bytes: &[u8]) {
        let mut remaining = bytes;
        while !remaining.is_empty() {
            let slot = rb.begin_receive();
            let n = remaining.len().min(slot.len());
            slot[..n].copy_from_slice(&remaining[..n]);
            rb.end_receive(n);
            remaining = &remaining[n..];
        }
    }

    #[test]
    fn empty_buffer_yields_nothing() {
        let mut rb = ReadBuffer::new();
        assert_eq!(rb.try_read_next().unwrap(), None);
    }

    #[test]
    fn partial_header_yields_nothing() {
        let mut rb = ReadBuffer::new();
        push(&mut rb, &[0x01, 0x00]);
        assert_eq!(rb.try_read_next().unwrap(), None);
    }

    #[test]
    fn decodes_a_full_message_frame() {
        let wire = encode_frame(PacketType::Message, b"hello world", false).unwrap();
        let mut rb = ReadBuffer::new();
        push(&mut rb, &wire);
        let frame = rb.try_read_next().unwrap().unwrap();
        assert_eq!(frame, DecodedFrame::Message(b"hello world".to_vec()));
        assert_eq!(rb.try_read_next().unwrap(), None);
    }

    #[test]
    fn decodes_two_back_to_back_frames_delivered_in_one_push() {
        let mut wire = encode_frame(PacketType::Message, b"one", false).unwrap();
        wire.extend(encode_frame(PacketType::Message, b"two", false).unwrap());
        let mut rb = ReadBuffer::new();
        push(&mut rb, &wire);
        assert_eq!(rb.try_read_next().unwrap().unwrap(), DecodedFrame::Message(b"one".to_vec()));
        assert_eq!(rb.try_read_next().unwrap().unwrap(), DecodedFrame::Message(b"two".to_vec()));
        assert_eq!(rb.try_read_next().unwrap(), None);
    }

    #[test]
    fn incremental_byte_at_a_time_delivery_still_decodes() {
        let wire = encode_frame(PacketType::Message, b"trickle", false).unwrap();
        let mut rb = ReadBuffer::new();
        for byte in &wire {
            push(&mut rb, std::slice::from_ref(byte));
            if rb.try_read_next().unwrap().is_some() {
                panic!("should not decode before all bytes arrive");
            }
        }
    }

    #[test]
    fn ping_and_ping_response_are_passed_through_verbatim() {
        let mut rb = ReadBuffer::new();
        push(&mut rb, &encode_frame(PacketType::Ping, &[1, 2, 3, 4], false).unwrap());
        push(&mut rb, &encode_frame(PacketType::PingResponse, &[9, 9, 9, 9], false).unwrap());
        assert_eq!(rb.try_read_next().unwrap().unwrap(), DecodedFrame::Ping(vec![1, 2, 3, 4]));
        assert_eq!(rb.try_read_next().unwrap().unwrap(), DecodedFrame::PingResponse(vec![9, 9, 9, 9]));
    }

    #[test]
    fn unknown_packet_type_is_a_hard_error() {
        let header = PacketHeader::encode(PacketType::HealthCheck, Compression::None, 0);
        let mut rb = ReadBuffer::new();
        push(&mut rb, &header);
        let err = rb.try_read_next().unwrap_err();
        assert!(matches!(err, CodecError::UnknownPacketType(_)));
    }

    #[test]
    fn compressed_payload_is_decoded_transparently() {
        let payload = vec![0x77u8; 20 * 1024];
        let wire = encode_frame(PacketType::Message, &payload, true).unwrap();
        let mut rb = ReadBuffer::new();
        push(&mut rb, &wire);
        assert_eq!(rb.try_read_next().unwrap().unwrap(), DecodedFrame::Message(payload));
    }

    #[test]
    fn a_frame_larger_than_the_default_anticipated_size_still_decodes() {
        let payload = vec![0x11u8; DEFAULT_ANTICIPATED_FRAME * 3];
        let wire = encode_frame(PacketType::Message, &payload, false).unwrap();
        let mut rb = ReadBuffer::new();
        push(&mut rb, &wire);
        assert_eq!(rb.try_read_next().unwrap().unwrap(), DecodedFrame::Message(payload));
    }

    #[test]
    fn oversized_wire_payload_is_rejected() {
        let header =
            PacketHeader::encode(PacketType::Message, Compression::None, starlane_proto::MAX_WIRE_PAYLOAD + 1);
        let mut rb = ReadBuffer::new();
        push(&mut rb, &header);
        let err = rb.try_read_next().unwrap_err();
        assert!(matches!(err, CodecError::WireMessageTooLarge { .. }));
    }
}
