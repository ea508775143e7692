//! Pool error types.

use thiserror::Error;

/// Result type for pool operations.
pub type PoolResult<T> = std::result::Result<T, PoolError>;

/// Errors raised while building pools or checking out connections.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Server unreachable or connection lost.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Connect, checkout, or command timed out.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Invalid URL or options.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Sentinel could not name a server for the service.
    #[error("Sentinel error: {0}")]
    Sentinel(String),

    /// The server answered with an error.
    #[error("Command error: {0}")]
    Command(String),
}

impl PoolError {
    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Timeout(_) | Self::Sentinel(_)
        )
    }

    /// Check if this error means the server could not be talked to.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Timeout(_) | Self::Sentinel(_)
        )
    }
}

impl From<redis::RedisError> for PoolError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            Self::Connection(err.to_string())
        } else {
            Self::Command(err.to_string())
        }
    }
}

impl From<bb8::RunError<PoolError>> for PoolError {
    fn from(err: bb8::RunError<PoolError>) -> Self {
        match err {
            bb8::RunError::User(err) => err,
            bb8::RunError::TimedOut => {
                Self::Timeout("timed out waiting for a pooled connection".to_string())
            }
        }
    }
}

impl From<url::ParseError> for PoolError {
    fn from(err: url::ParseError) -> Self {
        Self::Config(format!("invalid connection URL: {}", err))
    }
}
