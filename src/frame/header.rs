//! Fixed 12-byte frame header.

#![expect(
    clippy::little_endian_bytes,
    reason = "wire format fixes little-endian integers"
)]

use super::HEADER_LEN;

/// Role of the envelope carried by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Kind was never set by the sender.
    Unset,
    /// Frame carries a request envelope.
    Request,
    /// Frame carries a response envelope.
    Response,
}

impl MessageKind {
    /// Decode a raw wire value, returning `None` for unknown kinds.
    #[must_use]
    pub const fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::Unset),
            1 => Some(Self::Request),
            2 => Some(Self::Response),
            _ => None,
        }
    }

    /// Return the wire value for this kind.
    #[must_use]
    pub const fn as_raw(self) -> i32 {
        match self {
            Self::Unset => 0,
            Self::Request => 1,
            Self::Response => 2,
        }
    }
}

/// Raw frame header as read from the wire.
///
/// Fields are kept as the signed values the peer sent so that invalid headers
/// can still be consumed and reported; use [`FrameHeader::message_kind`] and
/// [`FrameHeader::payload_len`] for validated views.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Raw message kind (0 = unset, 1 = request, 2 = response).
    pub kind: i32,
    /// Registered payload type id.
    pub type_id: i32,
    /// Payload length in bytes.
    pub length: i32,
}

impl FrameHeader {
    /// Build a header for an outbound frame.
    #[must_use]
    pub const fn new(kind: MessageKind, type_id: i32, length: i32) -> Self {
        Self {
            kind: kind.as_raw(),
            type_id,
            length,
        }
    }

    /// Parse a header from a 12-byte buffer.
    #[must_use]
    pub const fn from_bytes(buf: &[u8; HEADER_LEN]) -> Self {
        Self {
            kind: i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            type_id: i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            length: i32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
        }
    }

    /// Serialise the header into a 12-byte array.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&self.kind.to_le_bytes());
        buf[4..8].copy_from_slice(&self.type_id.to_le_bytes());
        buf[8..12].copy_from_slice(&self.length.to_le_bytes());
        buf
    }

    /// Return the message kind when it is a known request or response.
    #[must_use]
    pub const fn message_kind(&self) -> Option<MessageKind> {
        match MessageKind::from_raw(self.kind) {
            Some(kind @ (MessageKind::Request | MessageKind::Response)) => Some(kind),
            _ => None,
        }
    }

    /// Return the payload length, or `None` when the peer sent a negative value.
    #[must_use]
    pub fn payload_len(&self) -> Option<usize> { usize::try_from(self.length).ok() }
}
