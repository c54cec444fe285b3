//! Request and response envelopes carried inside a frame payload.
//!
//! Both envelope shapes start with the request identifier so the receive loop
//! can decode an [`EnvelopeHead`] without knowing the concrete payload type;
//! the full envelope is decoded later by whoever owns that type.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Status carried by every response envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseOutcome {
    /// The request was served and the payload holds the result.
    Success,
    /// The peer could not identify the request's payload type.
    ProtocolNotRecognised,
    /// The peer has no handler for the request's payload type.
    RequestNotHandled,
    /// The handler failed; `error` holds the detail.
    Error,
}

impl fmt::Display for ResponseOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Success => "success",
            Self::ProtocolNotRecognised => "protocol not recognised",
            Self::RequestNotHandled => "request not handled",
            Self::Error => "error",
        })
    }
}

/// Leading field shared by requests and responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeHead {
    /// Identifier pairing a response with its request.
    pub request_identifier: String,
}

/// Request envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request<T> {
    /// Globally unique identifier chosen by the sender.
    pub request_identifier: String,
    /// Request payload.
    pub payload: T,
}

impl<T> Request<T> {
    /// Wrap `payload` with the given identifier.
    pub fn new(request_identifier: impl Into<String>, payload: T) -> Self {
        Self {
            request_identifier: request_identifier.into(),
            payload,
        }
    }
}

/// Response envelope.
///
/// `payload` is present only when `outcome` is [`ResponseOutcome::Success`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response<T> {
    /// Identifier copied from the request being answered.
    pub request_identifier: String,
    /// Whether the request was served.
    pub outcome: ResponseOutcome,
    /// Human-readable failure detail.
    pub error: Option<String>,
    /// Response payload on success.
    pub payload: Option<T>,
}

impl<T> Response<T> {
    /// Build a successful response.
    pub fn success(request_identifier: impl Into<String>, payload: T) -> Self {
        Self {
            request_identifier: request_identifier.into(),
            outcome: ResponseOutcome::Success,
            error: None,
            payload: Some(payload),
        }
    }

    /// Build a failed response carrying no payload.
    pub fn failure(
        request_identifier: impl Into<String>,
        outcome: ResponseOutcome,
        error: Option<String>,
    ) -> Self {
        Self {
            request_identifier: request_identifier.into(),
            outcome,
            error,
            payload: None,
        }
    }
}
