// valkey-cache - a pluggable cache client for Valkey
//
// This library ties together the codec pipeline, pooled connections and the
// client variants (default, sharded, herd-protected, sentinel) behind one
// typed cache API.

// Re-export the cache API
pub use valkey_cache_client::*;

// Re-export member crates
pub use valkey_cache_codec as codec;
pub use valkey_cache_pool as pool;

pub use valkey_cache_codec::{Codec, CodecConfig, CodecError, CompressorKind, SerializerKind};
pub use valkey_cache_pool::{ConnectionOptions, FactoryKind, PoolConfig, PoolError, PoolKind, PoolRegistry, SentinelAddr};

// Prelude for common imports
pub mod prelude {
    pub use crate::{
        BlockingCache,
        Cache,
        CacheBuilder,
        CacheConfig,
        CacheError,
        CacheOptions,
        CacheResult,
        ClientKind,
        CompressorKind,
        ConnectionOptions,
        LockOptions,
        PoolConfig,
        SentinelAddr,
        SerializerKind,
        SetOptions,
        Timeout,
    };
}
