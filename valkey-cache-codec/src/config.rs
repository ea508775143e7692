//! Codec configuration.

use crate::{CompressorKind, SerializerKind};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default minimum payload size before compression kicks in.
pub const DEFAULT_MIN_LENGTH: usize = 15;

/// Serializer, compressor and compressor parameters.
///
/// Field names follow the cache `OPTIONS` mapping, e.g. `SERIALIZER`,
/// `COMPRESSOR`, `COMPRESS_MIN_LENGTH`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct CodecConfig {
    /// Serializer name.
    pub serializer: SerializerKind,
    /// Compressor name.
    pub compressor: CompressorKind,
    /// Compression level; `None` uses the compressor's own default.
    pub compress_level: Option<i32>,
    /// Payloads shorter than this are stored uncompressed.
    pub compress_min_length: usize,
    /// zlib `wbits` (window size and container).
    pub zlib_wbits: i32,
    /// Brotli window size (log2).
    pub brotli_lgwin: u32,
    /// Brotli input block size (log2), 0 for automatic.
    pub brotli_lgblock: u32,
    /// Path to a zstd dictionary shared by every writer and reader.
    pub zstd_dict: Option<PathBuf>,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            serializer: SerializerKind::default(),
            compressor: CompressorKind::default(),
            compress_level: None,
            compress_min_length: DEFAULT_MIN_LENGTH,
            zlib_wbits: 15,
            brotli_lgwin: 22,
            brotli_lgblock: 0,
            zstd_dict: None,
        }
    }
}

impl CodecConfig {
    /// Create a configuration for a serializer/compressor pair.
    pub fn new(serializer: SerializerKind, compressor: CompressorKind) -> Self {
        Self {
            serializer,
            compressor,
            ..Default::default()
        }
    }

    /// Read overrides from `VALKEY_CACHE_SERIALIZER`, `VALKEY_CACHE_COMPRESSOR`,
    /// `VALKEY_CACHE_COMPRESS_LEVEL` and `VALKEY_CACHE_COMPRESS_MIN_LENGTH`.
    ///
    /// Unparseable values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(name) = std::env::var("VALKEY_CACHE_SERIALIZER")
            && let Ok(kind) = name.parse() {
                config.serializer = kind;
            }

        if let Ok(name) = std::env::var("VALKEY_CACHE_COMPRESSOR")
            && let Ok(kind) = name.parse() {
                config.compressor = kind;
            }

        if let Ok(level) = std::env::var("VALKEY_CACHE_COMPRESS_LEVEL")
            && let Ok(level) = level.parse() {
                config.compress_level = Some(level);
            }

        if let Ok(min) = std::env::var("VALKEY_CACHE_COMPRESS_MIN_LENGTH")
            && let Ok(min) = min.parse() {
                config.compress_min_length = min;
            }

        config
    }

    /// Set the compression level.
    pub fn with_level(mut self, level: i32) -> Self {
        self.compress_level = Some(level);
        self
    }

    /// Set the compression threshold.
    pub fn with_min_length(mut self, min_length: usize) -> Self {
        self.compress_min_length = min_length;
        self
    }

    /// Set zlib `wbits`.
    pub fn with_zlib_wbits(mut self, wbits: i32) -> Self {
        self.zlib_wbits = wbits;
        self
    }

    /// Use a zstd dictionary file.
    pub fn with_zstd_dict(mut self, path: impl Into<PathBuf>) -> Self {
        self.zstd_dict = Some(path.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CodecConfig::default();
        assert_eq!(config.serializer, SerializerKind::Json);
        assert_eq!(config.compressor, CompressorKind::Identity);
        assert_eq!(config.compress_min_length, 15);
        assert_eq!(config.zlib_wbits, 15);
    }

    #[test]
    fn test_deserialize_options_mapping() {
        let config: CodecConfig = serde_json::from_str(
            r#"{
                "SERIALIZER": "django_valkey.serializers.msgpack.MSGPackSerializer",
                "COMPRESSOR": "gzip",
                "COMPRESS_LEVEL": 3
            }"#,
        )
        .unwrap();

        assert_eq!(config.serializer, SerializerKind::MsgPack);
        assert_eq!(config.compressor, CompressorKind::Gzip);
        assert_eq!(config.compress_level, Some(3));
        assert_eq!(config.compress_min_length, DEFAULT_MIN_LENGTH);
    }

    #[test]
    fn test_unknown_compressor_is_rejected() {
        let result: Result<CodecConfig, _> =
            serde_json::from_str(r#"{"COMPRESSOR": "django_valkey.compressors.bz2.Bz2Compressor"}"#);
        assert!(result.is_err());
    }
}
