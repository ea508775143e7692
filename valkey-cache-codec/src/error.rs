//! Error types for the codec pipeline.

use thiserror::Error;

/// Errors raised while encoding or decoding cached values.
#[derive(Error, Debug)]
pub enum CodecError {
    /// The serializer rejected the value.
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// The payload could not be turned back into the requested type.
    #[error("Deserialization failed: {0}")]
    Deserialization(String),

    /// Compression failed.
    #[error("Compression failed: {0}")]
    Compression(String),

    /// Decompression failed (corrupt or truncated payload).
    #[error("Decompression failed: {0}")]
    Decompression(String),

    /// The payload does not carry a header this codec understands.
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// A serializer or compressor name that is unknown or not compiled in.
    #[error("Unsupported codec: {0}")]
    Unsupported(String),

    /// Invalid codec parameter.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error while reading codec resources (dictionaries).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for codec operations.
pub type CodecResult<T> = std::result::Result<T, CodecError>;
