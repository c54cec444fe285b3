//! Compact binary payloads with zstd block compression.

use serde::{Serialize, de::DeserializeOwned};

use super::{PayloadSerializer, SerializerError};

/// zstd level used when none is given.
const DEFAULT_LEVEL: i32 = 3;

/// `bincode` encoding compressed as a single zstd block.
///
/// Payload types must avoid serde attributes that need a self-describing
/// format (`untagged`, `flatten`, `skip_serializing_if`).
#[derive(Debug, Clone, Copy)]
pub struct BinarySerializer {
    level: i32,
}

impl BinarySerializer {
    /// Create a serializer using the given zstd compression level.
    #[must_use]
    pub const fn with_level(level: i32) -> Self { Self { level } }
}

impl Default for BinarySerializer {
    fn default() -> Self { Self::with_level(DEFAULT_LEVEL) }
}

impl PayloadSerializer for BinarySerializer {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, SerializerError> {
        let raw = bincode::serde::encode_to_vec(value, bincode::config::standard())?;
        Ok(zstd::bulk::compress(&raw, self.level)?)
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, SerializerError> {
        let raw = zstd::stream::decode_all(bytes)?;
        let (value, _read) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())?;
        Ok(value)
    }
}
