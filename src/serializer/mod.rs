//! Pluggable payload encodings.
//!
//! A Session picks one [`SerializationFormat`] when it is built and uses it
//! for every envelope on that connection; nothing about the choice is
//! negotiated on the wire, so both peers must be configured alike.

mod binary;
mod compressed;
mod json;

use std::{fmt, io, str::FromStr};

use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

pub use self::{binary::BinarySerializer, compressed::CompressedJsonSerializer, json::JsonSerializer};

/// Errors raised while encoding or decoding a payload.
#[derive(Debug, Error)]
pub enum SerializerError {
    /// Structured-text encoding failed.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    /// The compression layer failed.
    #[error("compression: {0}")]
    Compression(#[from] io::Error),
    /// Binary encoding failed.
    #[error("binary encode: {0}")]
    BinaryEncode(#[from] bincode::error::EncodeError),
    /// Binary decoding failed.
    #[error("binary decode: {0}")]
    BinaryDecode(#[from] bincode::error::DecodeError),
}

/// Uniform encode/decode contract shared by all payload encodings.
///
/// Implementations are stateless: each call is independent and may run
/// concurrently with any other.
pub trait PayloadSerializer: Send + Sync {
    /// Encode `value` into bytes.
    ///
    /// # Errors
    /// Returns a [`SerializerError`] if the value cannot be encoded.
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, SerializerError>;

    /// Decode a value of type `T` from `bytes`.
    ///
    /// # Errors
    /// Returns a [`SerializerError`] if the bytes are not a valid encoding
    /// of `T`.
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, SerializerError>;
}

/// The encodings a Session can be configured with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SerializationFormat {
    /// Plain JSON.
    #[default]
    Json,
    /// JSON wrapped in a gzip stream.
    CompressedJson,
    /// Compact binary encoding with zstd block compression.
    Binary,
}

impl SerializationFormat {
    /// Every supported format.
    pub const ALL: [Self; 3] = [Self::Json, Self::CompressedJson, Self::Binary];

    /// Name used on the command line and in configuration files.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::CompressedJson => "compressed-json",
            Self::Binary => "binary",
        }
    }
}

impl PayloadSerializer for SerializationFormat {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, SerializerError> {
        match self {
            Self::Json => JsonSerializer.serialize(value),
            Self::CompressedJson => CompressedJsonSerializer::default().serialize(value),
            Self::Binary => BinarySerializer::default().serialize(value),
        }
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, SerializerError> {
        match self {
            Self::Json => JsonSerializer.deserialize(bytes),
            Self::CompressedJson => CompressedJsonSerializer::default().deserialize(bytes),
            Self::Binary => BinarySerializer::default().deserialize(bytes),
        }
    }
}

impl fmt::Display for SerializationFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Returned when a format name is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown serialization format `{0}` (expected json, compressed-json or binary)")]
pub struct UnknownFormat(pub String);

impl FromStr for SerializationFormat {
    type Err = UnknownFormat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|format| format.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownFormat(s.to_owned()))
    }
}
