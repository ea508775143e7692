//! Cache clients for Valkey.
//!
//! This crate provides:
//!
//! - **Key addressing**: `prefix:version:key` rendering with custom key
//!   functions and glob-safe patterns
//! - **Clients**: default (primary plus replicas), sharded, herd-protected
//!   and sentinel variants sharing one verb implementation
//! - **Locks**: token-based distributed locks with blocking acquisition
//! - **Cache facade**: typed verbs over the codec pipeline, with optional
//!   connection-error suppression
//! - **Blocking adapter**: the same verbs for synchronous callers
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use serde::{Deserialize, Serialize};
//! use valkey_cache_client::*;
//!
//! #[derive(Serialize, Deserialize)]
//! struct Session {
//!     user: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> CacheResult<()> {
//!     let config = CacheConfig::new("valkey://localhost:6379/0").with_key_prefix("app");
//!     let cache = Cache::new(config)?;
//!
//!     cache.set("session:1", &Session { user: "ada".into() }, Timeout::seconds(300)).await?;
//!     let session: Option<Session> = cache.get("session:1").await?;
//!     assert!(session.is_some());
//!
//!     let lock = cache.get_lock("report", LockOptions::default().timeout(std::time::Duration::from_secs(10)));
//!     lock.with_lock(|| async { Ok(()) }).await?;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod blocking;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod key;
pub mod lock;

pub use backend::{Backend, Command, Condition, Expiry, MemoryBackend, PooledBackend, Reply, glob_match};
pub use blocking::{BlockingCache, BlockingLock, BlockingLockGuard, KeyIter};
pub use cache::{Cache, CacheBuilder, SetOptions};
pub use client::{
    Access, CacheClient, Client, ClientKind, DEFAULT_HERD_TIMEOUT, DefaultClient, HerdPolicy, HerdRead, MEMORY_SCHEME, Replicated,
    ShardClient, ShardRing, Topology, hash_tag, sentinel_urls,
};
pub use config::{CacheConfig, CacheOptions, DEFAULT_LOCATION, DEFAULT_SCAN_ITERSIZE, DEFAULT_TIMEOUT, Timeout};
pub use error::{CacheError, CacheResult};
pub use key::{CacheKey, KeyFunc, KeyMaker, ReverseKeyFunc, default_key_func, default_reverse_key, glob_escape};
pub use lock::{DEFAULT_LOCK_SLEEP, Lock, LockGuard, LockOptions};
