//! Fuzz target for `ReadBuffer::try_read_next`.
//!
//! Feeds arbitrary byte streams through the streaming frame decoder the way
//! `StreamTransport` would feed it raw socket reads: in arbitrary chunk
//! sizes, back to back. This should never panic; every malformed header or
//! corrupt compressed payload must come back as a `CodecError`.

#![no_main]

use libfuzzer_sys::fuzz_target;
use starlane_net::read_buffer::ReadBuffer;

fuzz_target!(|chunks: Vec<Vec<u8>>| {
    let mut rb = ReadBuffer::new();

    for chunk in &chunks {
        let mut remaining = chunk.as_slice();
        while !remaining.is_empty() {
            let slot = rb.begin_receive();
            let n = remaining.len().min(slot.len());
            slot[..n].copy_from_slice(&remaining[..n]);
            rb.end_receive(n);
            remaining = &remaining[n..];

            loop {
                match rb.try_read_next() {
                    Ok(Some(_frame)) => continue,
                    Ok(None) => break,
                    Err(_) => break,
                }
            }
        }
    }
});
