//! Turns a [`RingBuffer`] fed from a transport into a stream of whole
//! [`Message`]s. This is the "frame codec" layer: fill, peek a header,
//! decide whether the body is fully buffered yet, consume and hand the
//! record to the caller.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::message::{Header, Message, UnknownMessageType};
use crate::ring_buffer::{RingBuffer, RingBufferError};
use crate::{HEADER_SIZE, RING_CAPACITY};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("transport closed")]
    Eof,
    #[error(transparent)]
    Io(#[from] RingBufferError),
    #[error(transparent)]
    UnknownType(#[from] UnknownMessageType),
    #[error("protocol fault: frame of {len} bytes exceeds ring capacity {capacity}")]
    OversizeFrame { len: usize, capacity: usize },
}

/// Owns the receive-side ring buffer and decodes whole messages out of it.
pub struct Codec {
    ring: RingBuffer,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec {
    pub fn new() -> Self {
        Self {
            ring: RingBuffer::new(),
        }
    }

    /// Pull more bytes from `reader` into the ring. `Ok(false)` means the
    /// transport reached end-of-stream, which callers must treat as
    /// terminal: end-of-stream on the transport is not recoverable.
    pub async fn fill<R>(&mut self, reader: &mut R) -> Result<bool, CodecError>
    where
        R: AsyncRead + Unpin,
    {
        match self.ring.fill_from_reader(reader).await? {
            usize::MAX => Ok(true), // full; let the caller drain via next_message first
            0 => Ok(false),
            _ => Ok(true),
        }
    }

    /// Decode and remove one whole message from the ring, if a complete
    /// header-plus-body is buffered. Returns `Ok(None)` when only a partial
    /// record is available, signalling the dispatcher to go back to the
    /// event loop rather than block.
    pub fn next_message(&mut self) -> Result<Option<Message>, CodecError> {
        let mut header_bytes = [0u8; HEADER_SIZE];
        if self.ring.peek(&mut header_bytes) != HEADER_SIZE {
            return Ok(None);
        }
        let header = Header::parse(&header_bytes);
        let body_len = header.len as usize;

        if HEADER_SIZE + body_len > RING_CAPACITY - 1 {
            return Err(CodecError::OversizeFrame {
                len: body_len,
                capacity: RING_CAPACITY - 1,
            });
        }

        if self.ring.available() < HEADER_SIZE + body_len {
            return Ok(None);
        }

        self.ring.skip(HEADER_SIZE);
        let mut payload = vec![0u8; body_len];
        self.ring.consume(&mut payload);

        Ok(Some(Message::from_parts(header, payload)?))
    }
}

/// Write one message to the transport. A partial write never happens here
/// because `tokio`'s `write_all` loops internally; program order across
/// multiple calls is preserved by giving each direction a single writer.
pub async fn write_message<W>(writer: &mut W, msg: &Message) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&msg.encode()).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;
    use std::io::Cursor;

    #[tokio::test]
    async fn decodes_one_message_split_across_two_fills() {
        let full = Message::new(MessageType::Console, b"ab".to_vec()).encode();
        let (first, second) = full.split_at(2);

        let mut codec = Codec::new();
        let mut reader = Cursor::new(first.to_vec());
        codec.fill(&mut reader).await.unwrap();
        assert!(codec.next_message().unwrap().is_none());

        let mut reader = Cursor::new(second.to_vec());
        codec.fill(&mut reader).await.unwrap();
        let msg = codec.next_message().unwrap().unwrap();
        assert_eq!(msg.ty, MessageType::Console);
        assert_eq!(msg.payload, b"ab");
    }

    #[tokio::test]
    async fn zero_length_payload_dispatches_empty() {
        let encoded = Message::empty(MessageType::PowerOn).encode();
        let mut codec = Codec::new();
        let mut reader = Cursor::new(encoded);
        codec.fill(&mut reader).await.unwrap();
        let msg = codec.next_message().unwrap().unwrap();
        assert!(msg.payload.is_empty());
    }

    #[tokio::test]
    async fn eof_is_reported() {
        let mut codec = Codec::new();
        let mut reader = Cursor::new(Vec::<u8>::new());
        let more = codec.fill(&mut reader).await.unwrap();
        assert!(!more);
    }

    #[tokio::test]
    async fn two_messages_back_to_back_both_decode_in_order() {
        let mut bytes = Message::new(MessageType::Console, b"1".to_vec()).encode();
        bytes.extend(Message::new(MessageType::Console, b"2".to_vec()).encode());

        let mut codec = Codec::new();
        let mut reader = Cursor::new(bytes);
        codec.fill(&mut reader).await.unwrap();

        let first = codec.next_message().unwrap().unwrap();
        let second = codec.next_message().unwrap().unwrap();
        assert_eq!(first.payload, b"1");
        assert_eq!(second.payload, b"2");
    }
}
