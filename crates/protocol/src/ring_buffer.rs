//! Fixed-capacity circular buffer over an async byte stream.
//!
//! Mirrors `circ_buf.c`: a power-of-two backing array, `head`/`tail` cursors
//! modulo capacity, one slot permanently unusable so `head == tail` means
//! empty rather than ambiguous with full. The synchronous `circ_fill()` /
//! `circ_peak()` / `circ_read()` triad becomes `fill_from_reader` (async),
//! `peek`, and `consume` here; "would-block" has no separate signal in the
//! async version because a `.await` on the reader already yields instead of
//! returning EAGAIN.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::RING_CAPACITY;

#[derive(Debug, Error)]
pub enum RingBufferError {
    #[error("transport read error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct RingBuffer {
    buf: Box<[u8; RING_CAPACITY]>,
    head: usize,
    tail: usize,
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl RingBuffer {
    pub fn new() -> Self {
        Self {
            buf: Box::new([0u8; RING_CAPACITY]),
            head: 0,
            tail: 0,
        }
    }

    /// Bytes currently buffered and unread.
    pub fn available(&self) -> usize {
        (self.head.wrapping_sub(self.tail)) & (RING_CAPACITY - 1)
    }

    /// Free space before the buffer would be considered full. One slot is
    /// always held back so `head == tail` stays unambiguous.
    pub fn space(&self) -> usize {
        (self.tail.wrapping_sub(self.head).wrapping_sub(1)) & (RING_CAPACITY - 1)
    }

    fn space_to_end(&self) -> usize {
        self.space().min(RING_CAPACITY - self.head)
    }

    fn available_to_end(&self) -> usize {
        self.available().min(RING_CAPACITY - self.tail)
    }

    /// Read as much as is available from `reader` into the free span of the
    /// buffer, without blocking past a single contiguous write. Returns the
    /// number of bytes read; `Ok(0)` is end-of-stream, matching `circ_fill`
    /// treating a zero-byte read as terminal (EPIPE in the original).
    ///
    /// If the buffer is already full, returns `Ok(usize::MAX)` as a sentinel
    /// for "no space, try consuming first" rather than performing a read —
    /// the async equivalent of `circ_fill` returning `-EAGAIN` immediately.
    pub async fn fill_from_reader<R>(&mut self, reader: &mut R) -> Result<usize, RingBufferError>
    where
        R: AsyncRead + Unpin,
    {
        let span = self.space_to_end();
        if span == 0 {
            return Ok(usize::MAX);
        }
        let start = self.head;
        let n = reader.read(&mut self.buf[start..start + span]).await?;
        self.head = (self.head + n) & (RING_CAPACITY - 1);
        Ok(n)
    }

    /// Copy up to `len` bytes into `out` without advancing `tail`. Returns
    /// the number of bytes copied; a short copy (fewer than `out.len()`)
    /// means not enough is buffered yet, matching `circ_peak`'s "all or
    /// nothing" contract observed by callers (they check the return value
    /// against the requested size).
    pub fn peek(&self, out: &mut [u8]) -> usize {
        let avail = self.available();
        let want = out.len().min(avail);
        let mut tail = self.tail;
        for slot in out.iter_mut().take(want) {
            *slot = self.buf[tail];
            tail = (tail + 1) & (RING_CAPACITY - 1);
        }
        want
    }

    /// Like [`peek`](Self::peek) but advances `tail` by the number of bytes
    /// copied.
    pub fn consume(&mut self, out: &mut [u8]) -> usize {
        let n = self.peek(out);
        self.tail = (self.tail + n) & (RING_CAPACITY - 1);
        n
    }

    /// Discard `len` bytes without copying them anywhere (used once a header
    /// has been peeked and needs to be dropped before the body is consumed
    /// on its own, or for skipping a record the dispatcher has already
    /// acted on via `peek`).
    pub fn skip(&mut self, len: usize) {
        let n = len.min(self.available());
        self.tail = (self.tail + n) & (RING_CAPACITY - 1);
    }

    #[cfg(test)]
    fn available_to_end_for_test(&self) -> usize {
        self.available_to_end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn fills_and_consumes_round_trip() {
        let mut ring = RingBuffer::new();
        let mut reader = Cursor::new(b"hello world".to_vec());
        let n = ring.fill_from_reader(&mut reader).await.unwrap();
        assert_eq!(n, 11);
        assert_eq!(ring.available(), 11);

        let mut out = [0u8; 11];
        let got = ring.consume(&mut out);
        assert_eq!(got, 11);
        assert_eq!(&out, b"hello world");
        assert_eq!(ring.available(), 0);
    }

    #[tokio::test]
    async fn peek_does_not_advance_tail() {
        let mut ring = RingBuffer::new();
        let mut reader = Cursor::new(b"abc".to_vec());
        ring.fill_from_reader(&mut reader).await.unwrap();

        let mut out = [0u8; 3];
        assert_eq!(ring.peek(&mut out), 3);
        assert_eq!(ring.available(), 3, "peek must not consume");
        assert_eq!(ring.consume(&mut out), 3);
        assert_eq!(ring.available(), 0);
    }

    #[tokio::test]
    async fn short_peek_reports_how_much_is_buffered() {
        let mut ring = RingBuffer::new();
        let mut reader = Cursor::new(b"ab".to_vec());
        ring.fill_from_reader(&mut reader).await.unwrap();

        let mut out = [0u8; 5];
        assert_eq!(ring.peek(&mut out), 2);
    }

    #[tokio::test]
    async fn eof_reports_zero() {
        let mut ring = RingBuffer::new();
        let mut reader = Cursor::new(Vec::<u8>::new());
        let n = ring.fill_from_reader(&mut reader).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn header_straddling_wrap_boundary_decodes_correctly() {
        let mut ring = RingBuffer::new();

        // Push the tail close to the end of the backing array so a 3-byte
        // header wraps around head==0.
        let near_end = crate::RING_CAPACITY - 2;
        let mut reader = Cursor::new(vec![0u8; near_end]);
        ring.fill_from_reader(&mut reader).await.unwrap();
        let mut sink = vec![0u8; near_end];
        ring.consume(&mut sink);
        assert_eq!(ring.available(), 0);
        assert_eq!(ring.head, near_end);
        assert_eq!(ring.tail, near_end);

        let mut reader = Cursor::new(vec![9u8, 1, 0]);
        // fill_from_reader only fills up to the contiguous span to the end
        // of the array, so two fills are needed to wrap.
        ring.fill_from_reader(&mut reader).await.unwrap();
        ring.fill_from_reader(&mut reader).await.unwrap();

        let mut header = [0u8; 3];
        assert_eq!(ring.peek(&mut header), 3);
        assert_eq!(header, [9, 1, 0]);
    }

    #[tokio::test]
    async fn space_to_end_never_exceeds_capacity() {
        let ring = RingBuffer::new();
        assert!(ring.space_to_end() <= crate::RING_CAPACITY);
        assert!(ring.available_to_end_for_test() == 0);
    }
}
