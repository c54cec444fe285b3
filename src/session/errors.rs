//! Caller-facing errors for Session operations.

use thiserror::Error;

use crate::{frame::FrameError, protocol::ResponseOutcome, serializer::SerializerError};

/// Errors returned by [`Session`](super::Session) request and response calls.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The Session had already finished when the call was made.
    #[error("session has terminated")]
    Terminated,
    /// The connection dropped before the response arrived.
    #[error("connection closed before a response arrived")]
    Disconnected,
    /// The peer answered with a failure outcome.
    #[error("peer reported {outcome}{}", detail_suffix(.detail.as_deref()))]
    Remote {
        /// Outcome carried by the response envelope.
        outcome: ResponseOutcome,
        /// Failure detail supplied by the peer.
        detail: Option<String>,
    },
    /// The payload type is not part of the Session's protocol.
    #[error("payload type `{0}` is not registered")]
    UnregisteredType(&'static str),
    /// The peer answered with a different payload type than expected.
    #[error("expected response type id {expected}, received {actual}")]
    UnexpectedResponseType {
        /// Registered id of the expected response type.
        expected: i32,
        /// Type id carried by the response frame.
        actual: i32,
    },
    /// A success response carried no payload.
    #[error("successful response carried no payload")]
    MissingPayload,
    /// Encoding or decoding an envelope failed.
    #[error(transparent)]
    Serializer(#[from] SerializerError),
    /// Writing the frame failed.
    #[error(transparent)]
    Frame(#[from] FrameError),
}

fn detail_suffix(detail: Option<&str>) -> String {
    detail.map(|d| format!(": {d}")).unwrap_or_default()
}

impl SessionError {
    /// Whether the error means the connection is gone.
    #[must_use]
    pub const fn is_disconnect(&self) -> bool { matches!(self, Self::Terminated | Self::Disconnected) }
}
