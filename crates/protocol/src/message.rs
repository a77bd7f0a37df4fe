//! The closed set of wire message types and the record that carries them.

use std::fmt;

use thiserror::Error;

use crate::HEADER_SIZE;

/// Tags recognized on the wire, numbered from 1 as in the original protocol.
/// `HARDRESET` is reserved: both roles accept and ignore it on receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    SelectBoard = 1,
    Console = 2,
    HardReset = 3,
    PowerOn = 4,
    PowerOff = 5,
    FastbootPresent = 6,
    FastbootDownload = 7,
    FastbootBoot = 8,
    StatusUpdate = 9,
    VbusOn = 10,
    VbusOff = 11,
    FastbootReboot = 12,
    SendBreak = 13,
    ListDevices = 14,
    BoardInfo = 15,
    FastbootContinue = 16,
    CaptureImage = 17,
}

impl MessageType {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl TryFrom<u8> for MessageType {
    type Error = UnknownMessageType;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => MessageType::SelectBoard,
            2 => MessageType::Console,
            3 => MessageType::HardReset,
            4 => MessageType::PowerOn,
            5 => MessageType::PowerOff,
            6 => MessageType::FastbootPresent,
            7 => MessageType::FastbootDownload,
            8 => MessageType::FastbootBoot,
            9 => MessageType::StatusUpdate,
            10 => MessageType::VbusOn,
            11 => MessageType::VbusOff,
            12 => MessageType::FastbootReboot,
            13 => MessageType::SendBreak,
            14 => MessageType::ListDevices,
            15 => MessageType::BoardInfo,
            16 => MessageType::FastbootContinue,
            17 => MessageType::CaptureImage,
            other => return Err(UnknownMessageType(other)),
        })
    }
}

#[derive(Debug, Error)]
#[error("unknown message type {0}")]
pub struct UnknownMessageType(pub u8);

/// A fully decoded wire record: tag plus payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub ty: MessageType,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(ty: MessageType, payload: Vec<u8>) -> Self {
        Self { ty, payload }
    }

    pub fn empty(ty: MessageType) -> Self {
        Self {
            ty,
            payload: Vec::new(),
        }
    }

    /// Serialize `type | len-le | payload` onto the wire. Panics (via a
    /// debug assertion) if the payload exceeds what a u16 length can carry;
    /// callers are required to keep payloads under 64 KiB, and upload chunks
    /// are capped far below that at [`crate::UPLOAD_CHUNK_SIZE`].
    pub fn encode(&self) -> Vec<u8> {
        debug_assert!(self.payload.len() <= u16::MAX as usize);
        let len = self.payload.len() as u16;
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        out.push(self.ty.as_u8());
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decode a header previously read with [`Header::parse`] plus its body.
    pub fn from_parts(header: Header, payload: Vec<u8>) -> Result<Self, UnknownMessageType> {
        Ok(Self {
            ty: MessageType::try_from(header.ty_raw)?,
            payload,
        })
    }
}

/// The fixed 3-byte header, parsed independently of the body so the codec
/// can decide whether the full record is buffered yet.
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub ty_raw: u8,
    pub len: u16,
}

impl Header {
    pub fn parse(bytes: &[u8; HEADER_SIZE]) -> Self {
        Header {
            ty_raw: bytes[0],
            len: u16::from_le_bytes([bytes[1], bytes[2]]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_header_and_payload() {
        let msg = Message::new(MessageType::Console, b"hello".to_vec());
        let encoded = msg.encode();
        assert_eq!(encoded[0], MessageType::Console.as_u8());
        let len = u16::from_le_bytes([encoded[1], encoded[2]]);
        assert_eq!(len as usize, msg.payload.len());
        assert_eq!(&encoded[3..], b"hello");
    }

    #[test]
    fn empty_payload_round_trips() {
        let msg = Message::empty(MessageType::PowerOn);
        let encoded = msg.encode();
        assert_eq!(encoded.len(), HEADER_SIZE);
    }

    #[test]
    fn rejects_unknown_type() {
        assert!(MessageType::try_from(200).is_err());
    }

    #[test]
    fn every_closed_tag_round_trips_through_u8() {
        let tags = [
            MessageType::SelectBoard,
            MessageType::Console,
            MessageType::HardReset,
            MessageType::PowerOn,
            MessageType::PowerOff,
            MessageType::FastbootPresent,
            MessageType::FastbootDownload,
            MessageType::FastbootBoot,
            MessageType::StatusUpdate,
            MessageType::VbusOn,
            MessageType::VbusOff,
            MessageType::FastbootReboot,
            MessageType::SendBreak,
            MessageType::ListDevices,
            MessageType::BoardInfo,
            MessageType::FastbootContinue,
            MessageType::CaptureImage,
        ];
        for tag in tags {
            assert_eq!(MessageType::try_from(tag.as_u8()).unwrap(), tag);
        }
    }
}
