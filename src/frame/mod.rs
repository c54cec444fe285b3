//! Provides the fixed-header wire frame used by every session.
//!
//! A frame is a 12-byte header (three little-endian `i32` values: message
//! kind, registered type id and payload length) followed by exactly `length`
//! payload bytes. [`FrameReader`] consumes frames from an [`AsyncRead`]
//! source and [`FrameEncoder`] writes them through a
//! [`tokio_util::codec::FramedWrite`].
//!
//! [`AsyncRead`]: tokio::io::AsyncRead

pub mod codec;
pub mod errors;
pub mod header;
pub mod reader;

pub use codec::{FrameEncoder, OutboundFrame, encode_frame};
pub use errors::FrameError;
pub use header::{FrameHeader, MessageKind};
pub use reader::{FrameReader, InboundFrame};

/// Length of a frame header in bytes.
pub const HEADER_LEN: usize = 12;
/// Default upper bound for a single frame payload.
///
/// Larger payloads are drained from the stream and reported as unrecognised
/// rather than buffered.
pub const MAX_PAYLOAD_SIZE: usize = 256 * 1024 * 1024; // 256 MiB
