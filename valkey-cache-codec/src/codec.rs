//! The serialize-then-compress pipeline.

use crate::compressor::{Compressor, IdentityCompressor};
use crate::integer::{as_integer, integer_into, parse_integer};
use crate::serializer::{Serializer, SerializerKind};
use crate::{CodecConfig, CodecError, CodecResult, DEFAULT_MIN_LENGTH};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Header byte of an uncompressed payload.
const PLAIN: u8 = 0x00;

/// First byte that may start a stored integer's text; compressor ids stay below.
const FIRST_PRINTABLE: u8 = 0x20;

/// Encodes values for storage and decodes them back.
///
/// Stored layout:
///
/// * integers: ASCII decimal (`b"42"`, `b"-7"`), so the server can INCR them;
/// * everything else: one header byte, then the serialized payload. The header
///   is `0x00` for uncompressed payloads, otherwise the compressor's id.
///
/// A payload is compressed when its serialized form is at least
/// `min_length` bytes long.
#[derive(Clone)]
pub struct Codec {
    serializer: SerializerKind,
    compressor: Arc<dyn Compressor>,
    min_length: usize,
}

impl Codec {
    /// Build a codec from a serializer and compressor.
    pub fn new(serializer: SerializerKind, compressor: Arc<dyn Compressor>) -> Self {
        Self {
            serializer,
            compressor,
            min_length: DEFAULT_MIN_LENGTH,
        }
    }

    /// Build the codec described by `config`.
    pub fn from_config(config: &CodecConfig) -> CodecResult<Self> {
        let compressor = config.compressor.build(config)?;
        Ok(Self::new(config.serializer, compressor).with_min_length(config.compress_min_length))
    }

    /// Replace the compressor with a custom implementation. Rejects ids a
    /// stored integer could start with.
    pub fn with_compressor(mut self, compressor: Arc<dyn Compressor>) -> CodecResult<Self> {
        let id = compressor.id();
        if id >= FIRST_PRINTABLE {
            return Err(CodecError::Config(format!(
                "compressor '{}' has id {:#04x}; ids must be below {:#04x}",
                compressor.name(),
                id,
                FIRST_PRINTABLE
            )));
        }
        self.compressor = compressor;
        Ok(self)
    }

    /// Set the compression threshold.
    pub fn with_min_length(mut self, min_length: usize) -> Self {
        self.min_length = min_length;
        self
    }

    /// The configured serializer.
    pub fn serializer(&self) -> SerializerKind {
        self.serializer
    }

    /// The configured compressor.
    pub fn compressor(&self) -> &dyn Compressor {
        self.compressor.as_ref()
    }

    /// Compression threshold in bytes.
    pub fn min_length(&self) -> usize {
        self.min_length
    }

    /// Encode a value.
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> CodecResult<Vec<u8>> {
        if let Some(int) = as_integer(value) {
            return Ok(int.to_string().into_bytes());
        }

        let serialized = self.serializer.dumps(value)?;
        let id = self.compressor.id();

        if id == PLAIN || serialized.len() < self.min_length {
            let mut out = Vec::with_capacity(serialized.len() + 1);
            out.push(PLAIN);
            out.extend_from_slice(&serialized);
            return Ok(out);
        }

        let compressed = self.compressor.compress(&serialized)?;
        trace!(
            compressor = self.compressor.name(),
            original = serialized.len(),
            compressed = compressed.len(),
            "Compressed cache value"
        );

        let mut out = Vec::with_capacity(compressed.len() + 1);
        out.push(id);
        out.extend_from_slice(&compressed);
        Ok(out)
    }

    /// Decode a value produced by [`Codec::encode`] with the same settings.
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> CodecResult<T> {
        if let Some(int) = parse_integer(bytes) {
            return integer_into(int).map_err(|e| {
                CodecError::Deserialization(format!("stored integer {}: {}", int, e))
            });
        }

        let (&header, payload) = bytes
            .split_first()
            .ok_or_else(|| CodecError::InvalidEnvelope("empty payload".to_string()))?;

        if header == PLAIN {
            return self.serializer.loads(payload);
        }

        let id = self.compressor.id();
        if id == PLAIN || header != id {
            return Err(CodecError::InvalidEnvelope(format!(
                "payload tagged with compressor id {}, codec uses '{}'",
                header,
                self.compressor.name()
            )));
        }

        let decompressed = self.compressor.decompress(payload)?;
        self.serializer.loads(&decompressed)
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(SerializerKind::default(), Arc::new(IdentityCompressor))
    }
}

impl fmt::Debug for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Codec")
            .field("serializer", &self.serializer)
            .field("compressor", &self.compressor.name())
            .field("min_length", &self.min_length)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CompressorKind;
    use crate::compressor::GzipCompressor;

    fn gzip_codec() -> Codec {
        Codec::new(SerializerKind::Json, Arc::new(GzipCompressor::default()))
    }

    #[test]
    fn test_integers_are_stored_as_text() {
        let codec = gzip_codec();
        assert_eq!(codec.encode(&42i64).unwrap(), b"42");
        assert_eq!(codec.encode(&-7i8).unwrap(), b"-7");
        assert_eq!(codec.decode::<i64>(b"42").unwrap(), 42);
        assert_eq!(codec.decode::<u32>(b"1001").unwrap(), 1001);
    }

    #[test]
    fn test_short_payload_is_not_compressed() {
        let codec = gzip_codec();
        let encoded = codec.encode("hi").unwrap();
        assert_eq!(encoded[0], PLAIN);
        assert_eq!(&encoded[1..], b"\"hi\"");
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let codec = gzip_codec().with_min_length(6);
        // "abcd" serializes to 6 bytes of JSON
        let at = codec.encode("abcd").unwrap();
        assert_eq!(at[0], 1);
        let below = codec.encode("abc").unwrap();
        assert_eq!(below[0], PLAIN);

        assert_eq!(codec.decode::<String>(&at).unwrap(), "abcd");
        assert_eq!(codec.decode::<String>(&below).unwrap(), "abc");
    }

    #[test]
    fn test_empty_payload_is_an_envelope_error() {
        let result: CodecResult<String> = Codec::default().decode(b"");
        assert!(matches!(result, Err(CodecError::InvalidEnvelope(_))));
    }

    #[test]
    fn test_foreign_compressor_tag_is_rejected() {
        let gzip = gzip_codec();
        let encoded = gzip.encode(&"x".repeat(100)).unwrap();

        let zlib = Codec::from_config(&CodecConfig::new(SerializerKind::Json, CompressorKind::Zlib))
            .unwrap();
        let result: CodecResult<String> = zlib.decode(&encoded);
        assert!(matches!(result, Err(CodecError::InvalidEnvelope(_))));

        let identity = Codec::default();
        let result: CodecResult<String> = identity.decode(&encoded);
        assert!(matches!(result, Err(CodecError::InvalidEnvelope(_))));
    }

    #[test]
    fn test_truncated_compressed_payload_fails() {
        let codec = gzip_codec();
        let mut encoded = codec.encode(&"y".repeat(500)).unwrap();
        encoded.truncate(8);
        let result: CodecResult<String> = codec.decode(&encoded);
        assert!(result.is_err());
    }

    #[test]
    fn test_integer_stored_value_read_as_string_fails() {
        let result: CodecResult<String> = Codec::default().decode(b"12");
        assert!(matches!(result, Err(CodecError::Deserialization(_))));
    }
}
