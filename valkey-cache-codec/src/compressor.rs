//! Value compressors.

use crate::{CodecConfig, CodecError, CodecResult};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;
use std::sync::Arc;

/// A byte-level compression strategy.
///
/// Every compressed payload is tagged with [`Compressor::id`], so ids must be
/// distinct between compressors that share a key space and lie in `1..0x20`
/// (printable bytes are reserved for stored integers). An id of `0` marks a
/// compressor that never compresses.
pub trait Compressor: Send + Sync + fmt::Debug {
    /// Envelope tag written in front of compressed payloads.
    fn id(&self) -> u8;

    /// Registry name.
    fn name(&self) -> &'static str;

    /// Compress a payload.
    fn compress(&self, data: &[u8]) -> CodecResult<Vec<u8>>;

    /// Decompress a payload produced by [`Compressor::compress`].
    fn decompress(&self, data: &[u8]) -> CodecResult<Vec<u8>>;
}

/// Pass-through compressor.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityCompressor;

impl Compressor for IdentityCompressor {
    fn id(&self) -> u8 {
        0
    }

    fn name(&self) -> &'static str {
        "identity"
    }

    fn compress(&self, data: &[u8]) -> CodecResult<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> CodecResult<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// Gzip compressor.
#[derive(Debug, Clone, Copy)]
pub struct GzipCompressor {
    level: u32,
}

impl GzipCompressor {
    /// Create a gzip compressor; `level` is clamped to 0..=9.
    pub fn new(level: u32) -> Self {
        Self {
            level: level.min(9),
        }
    }
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self::new(9)
    }
}

impl Compressor for GzipCompressor {
    fn id(&self) -> u8 {
        1
    }

    fn name(&self) -> &'static str {
        "gzip"
    }

    fn compress(&self, data: &[u8]) -> CodecResult<Vec<u8>> {
        use flate2::Compression;
        use flate2::write::GzEncoder;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::new(self.level));
        encoder
            .write_all(data)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        encoder
            .finish()
            .map_err(|e| CodecError::Compression(e.to_string()))
    }

    fn decompress(&self, data: &[u8]) -> CodecResult<Vec<u8>> {
        let mut out = Vec::new();
        flate2::read::GzDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        Ok(out)
    }
}

/// Container produced by [`ZlibCompressor`], derived from zlib's `wbits`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZlibContainer {
    /// `wbits` 9..=15: zlib header and trailer.
    Zlib,
    /// `wbits` 25..=31: gzip header and trailer.
    Gzip,
    /// `wbits` -15..=-9: raw deflate stream.
    Raw,
}

impl ZlibContainer {
    /// Map a zlib `wbits` value to its container.
    pub fn from_wbits(wbits: i32) -> CodecResult<Self> {
        match wbits {
            9..=15 => Ok(Self::Zlib),
            25..=31 => Ok(Self::Gzip),
            -15..=-9 => Ok(Self::Raw),
            other => Err(CodecError::Config(format!("invalid zlib wbits {}", other))),
        }
    }
}

/// Zlib compressor.
#[derive(Debug, Clone, Copy)]
pub struct ZlibCompressor {
    level: u32,
    container: ZlibContainer,
}

impl ZlibCompressor {
    /// Create a zlib compressor from a level and zlib-style `wbits`.
    pub fn new(level: u32, wbits: i32) -> CodecResult<Self> {
        Ok(Self {
            level: level.min(9),
            container: ZlibContainer::from_wbits(wbits)?,
        })
    }

    /// Container this compressor writes.
    pub fn container(&self) -> ZlibContainer {
        self.container
    }
}

impl Default for ZlibCompressor {
    fn default() -> Self {
        Self {
            level: 6,
            container: ZlibContainer::Zlib,
        }
    }
}

impl Compressor for ZlibCompressor {
    fn id(&self) -> u8 {
        2
    }

    fn name(&self) -> &'static str {
        "zlib"
    }

    fn compress(&self, data: &[u8]) -> CodecResult<Vec<u8>> {
        use flate2::Compression;
        use flate2::write::{DeflateEncoder, GzEncoder, ZlibEncoder};

        let level = Compression::new(self.level);
        let result = match self.container {
            ZlibContainer::Zlib => {
                let mut encoder = ZlibEncoder::new(Vec::new(), level);
                encoder.write_all(data).and_then(|_| encoder.finish())
            }
            ZlibContainer::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), level);
                encoder.write_all(data).and_then(|_| encoder.finish())
            }
            ZlibContainer::Raw => {
                let mut encoder = DeflateEncoder::new(Vec::new(), level);
                encoder.write_all(data).and_then(|_| encoder.finish())
            }
        };
        result.map_err(|e| CodecError::Compression(e.to_string()))
    }

    fn decompress(&self, data: &[u8]) -> CodecResult<Vec<u8>> {
        use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};

        let mut out = Vec::new();
        let result = match self.container {
            ZlibContainer::Zlib => ZlibDecoder::new(data).read_to_end(&mut out),
            ZlibContainer::Gzip => GzDecoder::new(data).read_to_end(&mut out),
            ZlibContainer::Raw => DeflateDecoder::new(data).read_to_end(&mut out),
        };
        result.map_err(|e| CodecError::Decompression(e.to_string()))?;
        Ok(out)
    }
}

/// Brotli compressor.
#[cfg(feature = "brotli")]
#[derive(Debug, Clone, Copy)]
pub struct BrotliCompressor {
    quality: u32,
    lgwin: u32,
    lgblock: u32,
}

#[cfg(feature = "brotli")]
impl BrotliCompressor {
    /// Create a brotli compressor. `lgblock` 0 lets the encoder choose.
    pub fn new(quality: u32, lgwin: u32, lgblock: u32) -> CodecResult<Self> {
        if !(10..=24).contains(&lgwin) {
            return Err(CodecError::Config(format!("invalid brotli lgwin {}", lgwin)));
        }
        if lgblock != 0 && !(16..=24).contains(&lgblock) {
            return Err(CodecError::Config(format!("invalid brotli lgblock {}", lgblock)));
        }
        Ok(Self {
            quality: quality.min(11),
            lgwin,
            lgblock,
        })
    }
}

#[cfg(feature = "brotli")]
impl Default for BrotliCompressor {
    fn default() -> Self {
        Self {
            quality: 11,
            lgwin: 22,
            lgblock: 0,
        }
    }
}

#[cfg(feature = "brotli")]
impl Compressor for BrotliCompressor {
    fn id(&self) -> u8 {
        3
    }

    fn name(&self) -> &'static str {
        "brotli"
    }

    fn compress(&self, data: &[u8]) -> CodecResult<Vec<u8>> {
        let params = brotli::enc::BrotliEncoderParams {
            quality: self.quality as i32,
            lgwin: self.lgwin as i32,
            lgblock: self.lgblock as i32,
            ..Default::default()
        };

        let mut output = Vec::new();
        let mut reader = std::io::Cursor::new(data);
        brotli::BrotliCompress(&mut reader, &mut output, &params)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        Ok(output)
    }

    fn decompress(&self, data: &[u8]) -> CodecResult<Vec<u8>> {
        let mut output = Vec::new();
        brotli::BrotliDecompress(&mut std::io::Cursor::new(data), &mut output)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        Ok(output)
    }
}

/// Zstandard compressor with an optional shared dictionary.
#[cfg(feature = "zstd")]
#[derive(Clone)]
pub struct ZstdCompressor {
    level: i32,
    dictionary: Option<Arc<[u8]>>,
}

#[cfg(feature = "zstd")]
impl ZstdCompressor {
    /// Create a zstd compressor.
    pub fn new(level: i32) -> Self {
        Self {
            level: level.clamp(1, 22),
            dictionary: None,
        }
    }

    /// Use a pre-trained dictionary for both directions.
    pub fn with_dictionary(mut self, dictionary: impl Into<Arc<[u8]>>) -> Self {
        self.dictionary = Some(dictionary.into());
        self
    }
}

#[cfg(feature = "zstd")]
impl Default for ZstdCompressor {
    fn default() -> Self {
        Self::new(1)
    }
}

#[cfg(feature = "zstd")]
impl fmt::Debug for ZstdCompressor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZstdCompressor")
            .field("level", &self.level)
            .field("dictionary_len", &self.dictionary.as_ref().map(|d| d.len()))
            .finish()
    }
}

#[cfg(feature = "zstd")]
impl Compressor for ZstdCompressor {
    fn id(&self) -> u8 {
        4
    }

    fn name(&self) -> &'static str {
        "zstd"
    }

    fn compress(&self, data: &[u8]) -> CodecResult<Vec<u8>> {
        let result = match &self.dictionary {
            Some(dict) => zstd::stream::Encoder::with_dictionary(Vec::new(), self.level, dict)
                .and_then(|mut encoder| {
                    encoder.write_all(data)?;
                    encoder.finish()
                }),
            None => zstd::encode_all(data, self.level),
        };
        result.map_err(|e| CodecError::Compression(e.to_string()))
    }

    fn decompress(&self, data: &[u8]) -> CodecResult<Vec<u8>> {
        let result = match &self.dictionary {
            Some(dict) => zstd::stream::Decoder::with_dictionary(data, dict).and_then(|mut decoder| {
                let mut out = Vec::new();
                decoder.read_to_end(&mut out)?;
                Ok(out)
            }),
            None => zstd::decode_all(data),
        };
        result.map_err(|e| CodecError::Decompression(e.to_string()))
    }
}

/// LZ4 frame compressor.
#[cfg(feature = "lz4")]
#[derive(Debug, Clone, Copy, Default)]
pub struct Lz4Compressor {
    level: u32,
}

#[cfg(feature = "lz4")]
impl Lz4Compressor {
    /// Create an LZ4 compressor; level 0 is the fast default.
    pub fn new(level: u32) -> Self {
        Self { level }
    }
}

#[cfg(feature = "lz4")]
impl Compressor for Lz4Compressor {
    fn id(&self) -> u8 {
        5
    }

    fn name(&self) -> &'static str {
        "lz4"
    }

    fn compress(&self, data: &[u8]) -> CodecResult<Vec<u8>> {
        let mut encoder = lz4::EncoderBuilder::new()
            .level(self.level)
            .build(Vec::new())
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        encoder
            .write_all(data)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        let (compressed, result) = encoder.finish();
        result.map_err(|e| CodecError::Compression(e.to_string()))?;
        Ok(compressed)
    }

    fn decompress(&self, data: &[u8]) -> CodecResult<Vec<u8>> {
        let mut decoder =
            lz4::Decoder::new(data).map_err(|e| CodecError::Decompression(e.to_string()))?;
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        Ok(out)
    }
}

/// Compressor registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressorKind {
    /// No compression (default)
    #[default]
    Identity,
    /// Gzip via flate2
    Gzip,
    /// Zlib via flate2
    Zlib,
    /// Brotli
    Brotli,
    /// Zstandard
    Zstd,
    /// LZ4 frames
    Lz4,
}

impl CompressorKind {
    /// All registered compressors, whether compiled in or not.
    pub const ALL: [CompressorKind; 6] = [
        Self::Identity,
        Self::Gzip,
        Self::Zlib,
        Self::Brotli,
        Self::Zstd,
        Self::Lz4,
    ];

    /// Registry name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Gzip => "gzip",
            Self::Zlib => "zlib",
            Self::Brotli => "brotli",
            Self::Zstd => "zstd",
            Self::Lz4 => "lz4",
        }
    }

    /// Check if this compressor was compiled in.
    pub fn is_available(&self) -> bool {
        match self {
            Self::Identity | Self::Gzip | Self::Zlib => true,
            Self::Brotli => cfg!(feature = "brotli"),
            Self::Zstd => cfg!(feature = "zstd"),
            Self::Lz4 => cfg!(feature = "lz4"),
        }
    }

    /// Instantiate the compressor with the parameters in `config`.
    pub fn build(&self, config: &CodecConfig) -> CodecResult<Arc<dyn Compressor>> {
        let level = config.compress_level;
        match self {
            Self::Identity => Ok(Arc::new(IdentityCompressor)),
            Self::Gzip => Ok(Arc::new(
                level.map_or_else(GzipCompressor::default, |l| GzipCompressor::new(l as u32)),
            )),
            Self::Zlib => Ok(Arc::new(ZlibCompressor::new(
                level.unwrap_or(6) as u32,
                config.zlib_wbits,
            )?)),
            #[cfg(feature = "brotli")]
            Self::Brotli => Ok(Arc::new(BrotliCompressor::new(
                level.unwrap_or(11) as u32,
                config.brotli_lgwin,
                config.brotli_lgblock,
            )?)),
            #[cfg(feature = "zstd")]
            Self::Zstd => {
                let mut compressor = ZstdCompressor::new(level.unwrap_or(1));
                if let Some(path) = &config.zstd_dict {
                    let dict = std::fs::read(path)?;
                    compressor = compressor.with_dictionary(dict);
                }
                Ok(Arc::new(compressor))
            }
            #[cfg(feature = "lz4")]
            Self::Lz4 => Ok(Arc::new(Lz4Compressor::new(level.unwrap_or(0) as u32))),
            #[allow(unreachable_patterns)]
            other => Err(CodecError::Unsupported(format!(
                "compressor '{}' not compiled in",
                other.name()
            ))),
        }
    }
}

impl FromStr for CompressorKind {
    type Err = CodecError;

    /// Accepts short names (`zstd`) as well as dotted class paths such as
    /// `django_valkey.compressors.zstd.ZStdCompressor`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = crate::registry_name(s, "compressor");
        match name.as_str() {
            "identity" | "none" => Ok(Self::Identity),
            "gzip" => Ok(Self::Gzip),
            "zlib" => Ok(Self::Zlib),
            "brotli" => Ok(Self::Brotli),
            "zstd" => Ok(Self::Zstd),
            "lz4" => Ok(Self::Lz4),
            _ => Err(CodecError::Unsupported(format!("compressor '{}'", s))),
        }
    }
}

impl fmt::Display for CompressorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for CompressorKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for CompressorKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}
