//! Connection factories and pools for valkey-cache.
//!
//! This crate provides:
//!
//! - **Connection parameters**: parsed once from `valkey://`, `rediss://` or
//!   `unix://` URLs
//! - **Pooling**: bb8 pools of multiplexed connections, created lazily
//! - **Sentinel discovery**: primary/replica addresses re-resolved on connect
//! - **Registry**: an owned map of pools keyed by canonical parameters
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use valkey_cache_pool::*;
//!
//! #[tokio::main]
//! async fn main() -> PoolResult<()> {
//!     let options = ConnectionOptions::from_env();
//!     let registry = Arc::new(PoolRegistry::new());
//!     let factory = options.connection_factory.build(&options, registry.clone())?;
//!
//!     let pool = factory.connect("valkey://localhost:6379/0")?;
//!     let mut conn = pool.get().await?;
//!     let _: String = redis::cmd("PING").query_async(&mut **conn).await?;
//!
//!     registry.disconnect();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod factory;
pub mod params;
pub mod pool;
pub mod registry;
pub mod sentinel;

pub use config::{
    ConnectionOptions, FactoryKind, PoolConfig, PoolKind, SentinelAddr, SentinelKwargs,
    opt_secs_serde, secs_serde,
};
pub use error::{PoolError, PoolResult};
pub use factory::{ConnectionFactory, DirectFactory, SentinelFactory};
pub use params::{Address, ConnectionParams, DEFAULT_PORT, Protocol};
pub use pool::{
    ConnectionPool, PoolState, PooledValkeyConnection, ValkeyConnection, ValkeyConnectionManager,
};
pub use registry::PoolRegistry;
pub use sentinel::SentinelResolver;

/// Re-export of the protocol client used by the pools.
pub use redis;
