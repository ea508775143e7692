//! Cache error types.

use thiserror::Error;
use valkey_cache_codec::CodecError;
use valkey_cache_pool::PoolError;

/// Result type for cache operations.
pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Errors raised by cache clients.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Server unreachable or connection lost.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Connect or command timeout.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Value could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Missing or conflicting options.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The client variant does not offer this operation.
    #[error("Not supported: {0}")]
    Unsupported(String),

    /// The server answered with an error.
    #[error("Command error: {0}")]
    Command(String),

    /// `incr`/`decr` on a key that does not exist.
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// Lock could not be acquired in time.
    #[error("Lock timeout: {0}")]
    LockTimeout(String),

    /// Lock release or extension by a caller that does not hold it.
    #[error("Lock not held: {0}")]
    LockNotHeld(String),
}

impl CacheError {
    /// Check if this error means the server could not be talked to. These
    /// are the errors `IGNORE_EXCEPTIONS` swallows.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout(_))
    }

    /// Check if retrying the operation could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Timeout(_) | Self::LockTimeout(_)
        )
    }
}

impl From<PoolError> for CacheError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Connection(msg) | PoolError::Sentinel(msg) => Self::Connection(msg),
            PoolError::Timeout(msg) => Self::Timeout(msg),
            PoolError::Config(msg) => Self::Config(msg),
            PoolError::Command(msg) => Self::Command(msg),
        }
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        PoolError::from(err).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_errors_keep_their_class() {
        let err: CacheError = PoolError::Sentinel("no primary".into()).into();
        assert!(err.is_connection_error());

        let err: CacheError = PoolError::Config("bad url".into()).into();
        assert!(matches!(err, CacheError::Config(_)));
        assert!(!err.is_connection_error());
    }

    #[test]
    fn test_codec_errors_are_not_connection_errors() {
        let err: CacheError = CodecError::InvalidEnvelope("x".into()).into();
        assert!(!err.is_connection_error());
        assert!(!err.is_retryable());
    }
}
