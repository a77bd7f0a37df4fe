//! Length-prefixed binary framing between the cdba controller and agent.
//!
//! A message on the wire is `u8 type | u16-le length | length bytes payload`,
//! carried over whatever byte transport links the two processes (conventionally
//! the stdio pair of a child `ssh` session). This crate owns the wire types,
//! the fixed-size ring buffer that absorbs partial reads from that transport,
//! and the codec that turns a stream of bytes into a stream of whole messages.

pub mod codec;
pub mod message;
pub mod ring_buffer;

pub use codec::{write_message, Codec, CodecError};
pub use message::{Message, MessageType};
pub use ring_buffer::RingBuffer;

/// Maximum payload size the ring buffer can ever hold a whole message for.
/// One byte less than the ring's capacity is reserved so `head == tail` is
/// unambiguously "empty" rather than colliding with "full".
pub const RING_CAPACITY: usize = 16384;

/// Upload chunks are kept well under [`RING_CAPACITY`] so a single
/// FASTBOOT_DOWNLOAD record can never itself trigger a protocol fault.
pub const UPLOAD_CHUNK_SIZE: usize = 2048;

/// Header size: one type byte plus a little-endian 16-bit length.
pub const HEADER_SIZE: usize = 3;
