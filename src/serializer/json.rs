//! Plain JSON payloads.

use serde::{Serialize, de::DeserializeOwned};

use super::{PayloadSerializer, SerializerError};

/// Uncompressed JSON encoding.
///
/// Field names follow the camelCase convention of the envelope types, which
/// keeps frames readable in packet captures.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl PayloadSerializer for JsonSerializer {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, SerializerError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, SerializerError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
