//! Outbound frame encoding.
//!
//! [`FrameEncoder`] plugs into [`tokio_util::codec::FramedWrite`] so a session
//! can hand whole frames to a sink and let the codec lay out header and
//! payload contiguously.

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::Encoder;

use super::{FrameError, FrameHeader, HEADER_LEN, MessageKind};

/// A frame waiting to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    /// Request or response.
    pub kind: MessageKind,
    /// Registered type id of the payload.
    pub type_id: i32,
    /// Serialised envelope.
    pub payload: Bytes,
}

impl OutboundFrame {
    /// Build an outbound frame.
    #[must_use]
    pub fn new(kind: MessageKind, type_id: i32, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            type_id,
            payload: payload.into(),
        }
    }

    fn header(&self) -> Result<FrameHeader, FrameError> {
        let length = i32::try_from(self.payload.len())
            .map_err(|_| FrameError::PayloadTooLarge(self.payload.len()))?;
        Ok(FrameHeader::new(self.kind, self.type_id, length))
    }
}

/// Tokio encoder for outbound frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameEncoder;

impl FrameEncoder {
    /// Create a new encoder.
    #[must_use]
    pub const fn new() -> Self { Self }
}

impl Encoder<OutboundFrame> for FrameEncoder {
    type Error = FrameError;

    fn encode(&mut self, item: OutboundFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let header = item.header()?;
        dst.reserve(HEADER_LEN + item.payload.len());
        dst.put_slice(&header.to_bytes());
        dst.put_slice(&item.payload);
        Ok(())
    }
}

/// Encode a single frame into a contiguous buffer.
///
/// # Errors
/// Returns [`FrameError::PayloadTooLarge`] if the payload length does not fit
/// the signed 32-bit length field.
pub fn encode_frame(
    kind: MessageKind,
    type_id: i32,
    payload: &[u8],
) -> Result<Vec<u8>, FrameError> {
    let mut buf = BytesMut::new();
    FrameEncoder.encode(
        OutboundFrame::new(kind, type_id, Bytes::copy_from_slice(payload)),
        &mut buf,
    )?;
    Ok(buf.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoder_writes_header_then_payload() {
        let mut buf = BytesMut::new();
        FrameEncoder::new()
            .encode(
                OutboundFrame::new(MessageKind::Response, 4, &b"hello"[..]),
                &mut buf,
            )
            .expect("encode");

        assert_eq!(buf.len(), HEADER_LEN + 5);
        let header_bytes: [u8; HEADER_LEN] = buf[..HEADER_LEN].try_into().expect("header");
        let header = FrameHeader::from_bytes(&header_bytes);
        assert_eq!(header, FrameHeader::new(MessageKind::Response, 4, 5));
        assert_eq!(&buf[HEADER_LEN..], b"hello");
    }
}
