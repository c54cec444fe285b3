//! Reads whole frames from an asynchronous byte stream.

use tokio::io::{self, AsyncRead, AsyncReadExt};

use super::{FrameError, FrameHeader, HEADER_LEN, MAX_PAYLOAD_SIZE};

/// A frame pulled off the wire.
///
/// `payload` is `None` when the header declared a length the reader refused
/// to buffer: a negative value, or one above the configured maximum. Oversized
/// payloads are still drained so the next header starts on a frame boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    /// Header exactly as the peer sent it.
    pub header: FrameHeader,
    /// Payload bytes, when they were accepted.
    pub payload: Option<Vec<u8>>,
}

/// Sequential frame reader.
///
/// Reads block until a full frame arrives; idle connections are expected, so
/// no read timeout is applied.
pub struct FrameReader<R> {
    reader: R,
    max_payload: usize,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    /// Create a reader with the default payload limit.
    #[must_use = "create a reader"]
    #[expect(
        clippy::missing_const_for_fn,
        reason = "const fn with non-const trait bounds (AsyncRead + Unpin) is misleading"
    )]
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            max_payload: MAX_PAYLOAD_SIZE,
        }
    }

    /// Override the largest payload the reader will buffer.
    #[must_use]
    pub const fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    /// Read the next frame.
    ///
    /// # Errors
    /// Returns [`FrameError::ShortHeader`] or [`FrameError::TruncatedPayload`]
    /// when the stream ends mid-frame, and [`FrameError::Io`] for other I/O
    /// failures.
    pub async fn read_frame(&mut self) -> Result<InboundFrame, FrameError> {
        let header = self.read_header().await?;
        let Some(len) = header.payload_len() else {
            return Ok(InboundFrame {
                header,
                payload: None,
            });
        };
        if len > self.max_payload {
            self.skip_payload(len).await?;
            return Ok(InboundFrame {
                header,
                payload: None,
            });
        }
        let payload = self.read_payload(len).await?;
        Ok(InboundFrame {
            header,
            payload: Some(payload),
        })
    }

    async fn read_header(&mut self) -> Result<FrameHeader, FrameError> {
        let mut buf = [0u8; HEADER_LEN];
        let received = read_full(&mut self.reader, &mut buf).await?;
        if received < HEADER_LEN {
            return Err(FrameError::ShortHeader { received });
        }
        Ok(FrameHeader::from_bytes(&buf))
    }

    async fn read_payload(&mut self, len: usize) -> Result<Vec<u8>, FrameError> {
        let mut payload = vec![0u8; len];
        let received = read_full(&mut self.reader, &mut payload).await?;
        if received < len {
            return Err(FrameError::TruncatedPayload {
                expected: len,
                received,
            });
        }
        Ok(payload)
    }

    async fn skip_payload(&mut self, len: usize) -> Result<(), FrameError> {
        let limit = u64::try_from(len).unwrap_or(u64::MAX);
        let mut limited = (&mut self.reader).take(limit);
        let copied = io::copy(&mut limited, &mut io::sink()).await?;
        if copied < limit {
            return Err(FrameError::TruncatedPayload {
                expected: len,
                received: usize::try_from(copied).unwrap_or(usize::MAX),
            });
        }
        Ok(())
    }
}

/// Fill `buf` from `reader`, returning how many bytes arrived before EOF.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while let Some(rest) = buf.get_mut(filled..) {
        if rest.is_empty() {
            break;
        }
        let n = reader.read(rest).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
