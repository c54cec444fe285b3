//! Error types for frame encoding and decoding.

use std::io;

use thiserror::Error;

/// Errors raised while reading or writing frames.
///
/// Every variant produced by [`FrameReader`](super::FrameReader) means the
/// underlying stream can no longer be trusted, so sessions treat them as a
/// disconnect rather than a protocol violation.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The stream ended before a complete header arrived.
    #[error("stream closed after {received} of 12 header bytes")]
    ShortHeader {
        /// Number of header bytes read before the stream ended.
        received: usize,
    },
    /// The stream ended before the declared payload length was read.
    #[error("stream closed after {received} of {expected} payload bytes")]
    TruncatedPayload {
        /// Declared payload length.
        expected: usize,
        /// Number of payload bytes read before the stream ended.
        received: usize,
    },
    /// An outbound payload does not fit the signed 32-bit length field.
    #[error("payload of {0} bytes exceeds the frame length field")]
    PayloadTooLarge(usize),
    /// I/O error from the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// A write did not complete within the configured timeout.
    #[error("I/O timeout")]
    Timeout,
}

impl FrameError {
    /// Returns `true` when the error reflects the peer closing the stream.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        match self {
            Self::ShortHeader { .. } | Self::TruncatedPayload { .. } => true,
            Self::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            Self::PayloadTooLarge(_) | Self::Timeout => false,
        }
    }
}
