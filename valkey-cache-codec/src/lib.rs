//! Serializer and compressor pipeline for cached values.
//!
//! Values pass through a [`Serializer`] and, once they reach a size
//! threshold, a [`Compressor`]. The composition is a [`Codec`], built from a
//! [`CodecConfig`] whose names come from the cache options mapping.
//!
//! # Example
//!
//! ```
//! use valkey_cache_codec::{Codec, CodecConfig, CompressorKind, SerializerKind};
//!
//! let config = CodecConfig::new(SerializerKind::MsgPack, CompressorKind::Gzip);
//! let codec = Codec::from_config(&config).unwrap();
//!
//! let bytes = codec.encode(&vec!["a", "b"]).unwrap();
//! let back: Vec<String> = codec.decode(&bytes).unwrap();
//! assert_eq!(back, vec!["a", "b"]);
//! ```

pub mod codec;
pub mod compressor;
pub mod config;
pub mod error;
pub mod integer;
pub mod serializer;

pub use codec::Codec;
pub use compressor::{Compressor, CompressorKind, GzipCompressor, IdentityCompressor, ZlibCompressor};
pub use config::{CodecConfig, DEFAULT_MIN_LENGTH};
pub use error::{CodecError, CodecResult};
pub use serializer::{BincodeSerializer, JsonSerializer, MsgPackSerializer, Serializer, SerializerKind};

#[cfg(feature = "brotli")]
pub use compressor::BrotliCompressor;
#[cfg(feature = "lz4")]
pub use compressor::Lz4Compressor;
#[cfg(feature = "zstd")]
pub use compressor::ZstdCompressor;

/// Normalizes a registry name: keeps the last dotted segment, lowercases it,
/// and strips a trailing role suffix (`JSONSerializer` -> `json`).
pub(crate) fn registry_name(name: &str, suffix: &str) -> String {
    let last = name.rsplit('.').next().unwrap_or(name);
    let lower: String = last
        .chars()
        .filter(|c| !matches!(c, '_' | '-'))
        .collect::<String>()
        .to_ascii_lowercase();
    match lower.strip_suffix(suffix) {
        Some(stripped) if !stripped.is_empty() => stripped.to_string(),
        _ => lower,
    }
}
