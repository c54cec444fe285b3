//! Gzip-compressed JSON payloads.

use std::io::Write;

use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use serde::{Serialize, de::DeserializeOwned};

use super::{PayloadSerializer, SerializerError};

/// JSON encoding wrapped in a gzip stream.
#[derive(Debug, Clone, Copy)]
pub struct CompressedJsonSerializer {
    level: Compression,
}

impl CompressedJsonSerializer {
    /// Create a serializer using the given gzip compression level.
    #[must_use]
    pub const fn with_level(level: Compression) -> Self { Self { level } }
}

impl Default for CompressedJsonSerializer {
    fn default() -> Self { Self::with_level(Compression::fast()) }
}

impl PayloadSerializer for CompressedJsonSerializer {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, SerializerError> {
        let mut encoder = GzEncoder::new(Vec::new(), self.level);
        serde_json::to_writer(&mut encoder, value)?;
        encoder.flush()?;
        Ok(encoder.finish()?)
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, SerializerError> {
        Ok(serde_json::from_reader(GzDecoder::new(bytes))?)
    }
}
