// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fixed-capacity byte ring shared by every capture call site and the streaming worker.
//!
//! Writers come in two flavours. [`RingBuffer::write_blocking`] stops at the first byte
//! that does not fit, so already-buffered output is never reordered or lost. It is used
//! by the explicit, low-rate write path. [`RingBuffer::write_overwrite`] always accepts
//! the whole input and evicts the oldest unread bytes when full. That is what the
//! high-rate debug capture uses, since its callers must never wait on the consumer.
//!
//! One slot of storage is never filled so that `head == tail` unambiguously means empty.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::errors::RingBufferError;

struct State {
    storage: Vec<u8>,
    // next byte to read
    head: usize,
    // next byte to write
    tail: usize,
    has_data: bool,
}

impl State {
    fn capacity(&self) -> usize {
        self.storage.len()
    }

    fn next(&self, pos: usize) -> usize {
        (pos + 1) % self.capacity()
    }

    fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    fn is_full(&self) -> bool {
        self.next(self.tail) == self.head
    }

    fn len(&self) -> usize {
        (self.tail + self.capacity() - self.head) % self.capacity()
    }

    fn put(&mut self, byte: u8) -> bool {
        if self.is_full() {
            return false;
        }
        self.storage[self.tail] = byte;
        self.tail = self.next(self.tail);
        true
    }

    fn put_clobber(&mut self, byte: u8) {
        if self.is_full() {
            self.head = self.next(self.head);
        }
        self.storage[self.tail] = byte;
        self.tail = self.next(self.tail);
    }

    fn drain_into(&mut self, out: &mut [u8]) -> usize {
        let mut n = 0;
        while n < out.len() && !self.is_empty() {
            out[n] = self.storage[self.head];
            self.head = self.next(self.head);
            n += 1;
        }
        if self.is_empty() {
            self.has_data = false;
        }
        n
    }
}

/// Bounded circular byte store with a "has data" signal for a single waiting reader.
pub struct RingBuffer {
    state: Mutex<State>,
    non_empty: Notify,
}

impl RingBuffer {
    /// Allocates `capacity` bytes of storage. Usable space is `capacity - 1`.
    pub fn new(capacity: usize) -> Result<Self, RingBufferError> {
        if capacity < 2 {
            return Err(RingBufferError::InvalidCapacity(capacity));
        }

        let mut storage = Vec::new();
        storage
            .try_reserve_exact(capacity)
            .map_err(|_| RingBufferError::Allocation(capacity))?;
        storage.resize(capacity, 0);

        Ok(Self {
            state: Mutex::new(State {
                storage,
                head: 0,
                tail: 0,
                has_data: false,
            }),
            non_empty: Notify::new(),
        })
    }

    /// Releases the buffer, returning how many unread bytes were discarded with it.
    pub fn terminate(self) -> usize {
        let state = self.state.into_inner().unwrap_or_else(PoisonError::into_inner);
        state.len()
    }

    // Head and tail are only ever moved together under the lock, so a poisoned guard
    // still holds a consistent ring.
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocated size, one more than the bytes it can hold.
    pub fn capacity(&self) -> usize {
        self.lock().capacity()
    }

    /// Number of unread bytes.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when head and tail meet.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Free slots a blocking write could fill right now.
    pub fn free(&self) -> usize {
        let state = self.lock();
        state.capacity() - 1 - state.len()
    }

    /// State of the data signal. Raised by any non-empty write, lowered by the read
    /// that empties the ring.
    pub fn has_data(&self) -> bool {
        self.lock().has_data
    }

    /// Copies as much of `bytes` as fits, stopping at the first byte that does not.
    /// Nothing already buffered is touched. Returns the number of bytes accepted.
    pub fn write_blocking(&self, bytes: &[u8]) -> usize {
        let written = {
            let mut state = self.lock();
            let mut written = 0;
            for &byte in bytes {
                if !state.put(byte) {
                    break;
                }
                written += 1;
            }
            if written > 0 {
                state.has_data = true;
            }
            written
        };

        if written > 0 {
            self.non_empty.notify_one();
        }
        written
    }

    /// Copies all of `bytes`, discarding the oldest unread byte for every byte that
    /// would not otherwise fit. Never fails and never waits on the reader.
    pub fn write_overwrite(&self, bytes: &[u8]) -> usize {
        if bytes.is_empty() {
            return 0;
        }

        {
            let mut state = self.lock();
            for &byte in bytes {
                state.put_clobber(byte);
            }
            state.has_data = true;
        }

        self.non_empty.notify_one();
        bytes.len()
    }

    /// Drains up to `out.len()` bytes without waiting.
    pub fn read(&self, out: &mut [u8]) -> usize {
        if out.is_empty() {
            return 0;
        }
        self.lock().drain_into(out)
    }

    /// Waits for the "has data" signal, then behaves like [`RingBuffer::read`].
    ///
    /// With `timeout` of `None` this waits indefinitely. If the wait expires the buffer
    /// is left untouched and 0 is returned; a zero timeout on an empty buffer returns
    /// immediately.
    pub async fn read_wait(&self, out: &mut [u8], timeout: Option<Duration>) -> usize {
        if out.is_empty() {
            return 0;
        }

        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            // Register interest before checking so a write landing in between still wakes us.
            let notified = self.non_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.has_data {
                    return state.drain_into(out);
                }
            }

            match deadline {
                None => notified.await,
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return 0;
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("RingBuffer")
            .field("capacity", &state.capacity())
            .field("head", &state.head)
            .field("tail", &state.tail)
            .field("has_data", &state.has_data)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn drain(buffer: &RingBuffer) -> Vec<u8> {
        let mut out = vec![0u8; buffer.capacity()];
        let n = buffer.read(&mut out);
        out.truncate(n);
        out
    }

    #[test]
    fn test_rejects_tiny_capacity() {
        assert_eq!(
            RingBuffer::new(0).unwrap_err(),
            RingBufferError::InvalidCapacity(0)
        );
        assert_eq!(
            RingBuffer::new(1).unwrap_err(),
            RingBufferError::InvalidCapacity(1)
        );
        assert!(RingBuffer::new(2).is_ok());
    }

    #[test]
    fn test_overwrite_keeps_newest_bytes() {
        let buffer = RingBuffer::new(8).unwrap();
        assert_eq!(buffer.write_overwrite(b"ABCDEFGHIJ"), 10);
        assert_eq!(buffer.len(), 7);
        assert_eq!(drain(&buffer), b"DEFGHIJ");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_blocking_stops_when_full() {
        let buffer = RingBuffer::new(8).unwrap();
        assert_eq!(buffer.write_blocking(b"ABCDEFGHIJ"), 7);
        assert_eq!(buffer.write_blocking(b"K"), 0);
        assert_eq!(drain(&buffer), b"ABCDEFG");
    }

    #[test]
    fn test_empty_writes_are_noops() {
        let buffer = RingBuffer::new(8).unwrap();
        assert_eq!(buffer.write_blocking(b""), 0);
        assert_eq!(buffer.write_overwrite(b""), 0);
        assert!(!buffer.has_data());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_zero_length_read_leaves_signal() {
        let buffer = RingBuffer::new(8).unwrap();
        buffer.write_blocking(b"abc");
        assert_eq!(buffer.read(&mut []), 0);
        assert!(buffer.has_data());
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn test_signal_follows_emptiness() {
        let buffer = RingBuffer::new(8).unwrap();
        assert!(!buffer.has_data());

        buffer.write_blocking(b"abcd");
        assert!(buffer.has_data());

        let mut out = [0u8; 2];
        assert_eq!(buffer.read(&mut out), 2);
        assert_eq!(&out, b"ab");
        assert!(buffer.has_data());

        assert_eq!(buffer.read(&mut out), 2);
        assert_eq!(&out, b"cd");
        assert!(!buffer.has_data());
        assert_eq!(buffer.read(&mut out), 0);
    }

    #[test]
    fn test_wraps_around_storage_end() {
        let buffer = RingBuffer::new(4).unwrap();
        let mut out = [0u8; 2];
        for round in 0..10u8 {
            assert_eq!(buffer.write_blocking(&[round, round + 1]), 2);
            assert_eq!(buffer.read(&mut out), 2);
            assert_eq!(out, [round, round + 1]);
        }
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_terminate_reports_unread() {
        let buffer = RingBuffer::new(16).unwrap();
        buffer.write_blocking(b"leftover");
        assert_eq!(buffer.terminate(), 8);
    }

    #[tokio::test]
    async fn test_read_wait_immediate_timeout_on_empty() {
        let buffer = RingBuffer::new(8).unwrap();
        let mut out = [0u8; 4];
        let started = std::time::Instant::now();
        assert_eq!(buffer.read_wait(&mut out, Some(Duration::ZERO)).await, 0);
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_read_wait_returns_buffered_data_without_waiting() {
        let buffer = RingBuffer::new(8).unwrap();
        buffer.write_overwrite(b"hi");
        let mut out = [0u8; 4];
        assert_eq!(buffer.read_wait(&mut out, Some(Duration::ZERO)).await, 2);
        assert_eq!(&out[..2], b"hi");
    }

    #[tokio::test]
    async fn test_read_wait_times_out_after_stale_wakeup() {
        let buffer = RingBuffer::new(8).unwrap();
        // leaves a stored wake-up behind with nothing to read
        buffer.write_blocking(b"x");
        let mut out = [0u8; 4];
        assert_eq!(buffer.read(&mut out), 1);

        let n = buffer
            .read_wait(&mut out, Some(Duration::from_millis(20)))
            .await;
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_read_wait_wakes_on_write() {
        let buffer = Arc::new(RingBuffer::new(64).unwrap());

        let reader = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move {
                let mut out = [0u8; 64];
                let n = buffer.read_wait(&mut out, None).await;
                out[..n].to_vec()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let writer = {
            let buffer = Arc::clone(&buffer);
            std::thread::spawn(move || buffer.write_blocking(b"wake up"))
        };
        assert_eq!(writer.join().unwrap(), 7);

        let received = tokio::time::timeout(Duration::from_secs(5), reader)
            .await
            .expect("reader was never woken")
            .unwrap();
        assert_eq!(received, b"wake up");
    }

    #[test]
    fn test_concurrent_blocking_writers_preserve_each_chunk() {
        let buffer = Arc::new(RingBuffer::new(4096).unwrap());
        let handles: Vec<_> = (0..4u8)
            .map(|id| {
                let buffer = Arc::clone(&buffer);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        assert_eq!(buffer.write_blocking(&[id; 8]), 8);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let bytes = drain(&buffer);
        assert_eq!(bytes.len(), 3200);
        for chunk in bytes.chunks(8) {
            assert!(chunk.iter().all(|b| *b == chunk[0]));
        }
    }

    // writer in the top two bits, record sequence (mod 8) in the next three, offset within
    // the record in the low three
    fn record(writer: u8, seq: usize) -> [u8; 8] {
        let mut record = [0u8; 8];
        for (pos, byte) in record.iter_mut().enumerate() {
            *byte = (writer << 6) | (((seq % 8) as u8) << 3) | pos as u8;
        }
        record
    }

    fn decode(byte: u8) -> (u8, u8, u8) {
        (byte >> 6, (byte >> 3) & 0b111, byte & 0b111)
    }

    /// Every read starts with at most one record whose head was evicted, followed by whole
    /// records, each writer's records in sequence.
    fn assert_untorn(read: &[u8]) {
        let mut last_seq: [Option<u8>; 4] = [None; 4];
        let mut offset = 0;
        while offset < read.len() {
            let (writer, seq, first_pos) = decode(read[offset]);
            if offset > 0 {
                assert_eq!(first_pos, 0, "record split at offset {offset} of {read:?}");
            }
            let end = offset + (8 - first_pos as usize);
            assert!(end <= read.len(), "read ends inside a record: {read:?}");
            for (i, byte) in read[offset..end].iter().enumerate() {
                assert_eq!(
                    decode(*byte),
                    (writer, seq, first_pos + i as u8),
                    "interleaved bytes in {read:?}"
                );
            }
            if let Some(prev) = last_seq[writer as usize] {
                assert_eq!(seq, (prev + 1) % 8, "writer {writer} out of order in {read:?}");
            }
            last_seq[writer as usize] = Some(seq);
            offset = end;
        }
    }

    #[test]
    fn test_overwrite_racing_reader_never_tears_records() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let buffer = Arc::new(RingBuffer::new(64).unwrap());
        let done = Arc::new(AtomicBool::new(false));

        let reader = {
            let buffer = Arc::clone(&buffer);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                // sized to the whole ring so every read drains it completely
                let mut out = vec![0u8; buffer.capacity()];
                let mut received = 0;
                loop {
                    let finished = done.load(Ordering::SeqCst);
                    let n = buffer.read(&mut out);
                    assert_untorn(&out[..n]);
                    received += n;
                    if finished && n == 0 {
                        return received;
                    }
                }
            })
        };

        let writers: Vec<_> = (0..4u8)
            .map(|writer| {
                let buffer = Arc::clone(&buffer);
                std::thread::spawn(move || {
                    for seq in 0..2000 {
                        assert_eq!(buffer.write_overwrite(&record(writer, seq)), 8);
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }
        done.store(true, Ordering::SeqCst);

        let received = reader.join().unwrap();
        assert!(received > 0);
        assert!(buffer.is_empty());
    }

    proptest! {
        #[test]
        fn overwrite_retains_most_recent_bytes(
            capacity in 2usize..64,
            writes in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..40), 1..20),
        ) {
            let buffer = RingBuffer::new(capacity).unwrap();
            let mut all = Vec::new();
            for chunk in &writes {
                prop_assert_eq!(buffer.write_overwrite(chunk), chunk.len());
                all.extend_from_slice(chunk);
            }

            let keep = all.len().min(capacity - 1);
            let expected = &all[all.len() - keep..];
            prop_assert_eq!(drain(&buffer), expected.to_vec());
        }

        #[test]
        fn blocking_never_exceeds_free_slots(
            capacity in 2usize..64,
            ops in prop::collection::vec((prop::collection::vec(any::<u8>(), 0..40), 0usize..40), 1..30),
        ) {
            let buffer = RingBuffer::new(capacity).unwrap();
            let mut accepted = Vec::new();
            let mut received = Vec::new();

            for (chunk, read_len) in &ops {
                let free = buffer.free();
                let before = buffer.len();
                let n = buffer.write_blocking(chunk);
                prop_assert_eq!(n, chunk.len().min(free));
                prop_assert_eq!(buffer.len(), before + n);
                accepted.extend_from_slice(&chunk[..n]);

                let mut out = vec![0u8; *read_len];
                let got = buffer.read(&mut out);
                received.extend_from_slice(&out[..got]);
            }
            received.extend(drain(&buffer));

            prop_assert_eq!(received, accepted);
            prop_assert!(buffer.is_empty());
            prop_assert!(!buffer.has_data());
        }
    }
}
