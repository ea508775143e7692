//! Cache clients.
//!
//! Every variant is a [`Client`] over a [`Topology`]: the default, herd and
//! sentinel clients route over a [`Replicated`] primary/replica set, the
//! sharded client over a [`ShardRing`]. [`CacheClient`] is the byte-level,
//! object-safe interface the [`Cache`](crate::Cache) facade drives;
//! [`ClientKind`] selects the variant named by `CLIENT_CLASS`.

mod default;
mod herd;
mod sentinel;
mod sharded;
mod topology;

pub use default::{Client, DefaultClient};
pub use herd::{DEFAULT_HERD_TIMEOUT, HerdPolicy, HerdRead};
pub use sentinel::sentinel_urls;
pub use sharded::{ShardClient, ShardRing, hash_tag};
pub use topology::{Access, Replicated, Topology};

use crate::backend::{Backend, Condition, MemoryBackend, PooledBackend};
use crate::config::CacheOptions;
use crate::error::{CacheError, CacheResult};
use crate::key::CacheKey;
use crate::lock::{Lock, LockOptions};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use valkey_cache_pool::{ConnectionFactory, PoolKind};

/// Scheme of in-process servers, mostly for tests and local development.
pub const MEMORY_SCHEME: &str = "memory://";

/// Byte-level cache verbs over rendered keys.
///
/// TTLs are resolved by the caller: `None` never expires and a zero
/// duration expires immediately.
#[async_trait]
pub trait CacheClient: Send + Sync {
    /// Variant of this client.
    fn kind(&self) -> ClientKind;

    /// Fetch a value.
    async fn get(&self, key: &CacheKey) -> CacheResult<Option<Vec<u8>>>;

    /// Store a value. Returns whether the write happened, which only
    /// differs from `true` under a condition. A zero TTL deletes the key;
    /// with [`Condition::IfAbsent`] it reports whether the key was absent.
    async fn set(
        &self,
        key: &CacheKey,
        value: Vec<u8>,
        ttl: Option<Duration>,
        condition: Option<Condition>,
    ) -> CacheResult<bool>;

    /// Delete a key; returns whether it existed.
    async fn delete(&self, key: &CacheKey) -> CacheResult<bool>;

    /// Delete keys; returns how many existed.
    async fn delete_many(&self, keys: &[CacheKey]) -> CacheResult<u64>;

    /// Whether the key exists.
    async fn has_key(&self, key: &CacheKey) -> CacheResult<bool>;

    /// Remaining seconds: `Some(0)` for a missing key, `None` without expiry.
    async fn ttl(&self, key: &CacheKey) -> CacheResult<Option<u64>>;

    /// Remaining milliseconds, same conventions as [`CacheClient::ttl`].
    async fn pttl(&self, key: &CacheKey) -> CacheResult<Option<u64>>;

    /// Expire after `ttl`, whole seconds.
    async fn expire(&self, key: &CacheKey, ttl: Duration) -> CacheResult<bool>;

    /// Expire after `ttl`, whole milliseconds.
    async fn pexpire(&self, key: &CacheKey, ttl: Duration) -> CacheResult<bool>;

    /// Expire at `when`, second precision.
    async fn expire_at(&self, key: &CacheKey, when: SystemTime) -> CacheResult<bool>;

    /// Expire at `when`, millisecond precision.
    async fn pexpire_at(&self, key: &CacheKey, when: SystemTime) -> CacheResult<bool>;

    /// Remove the expiry.
    async fn persist(&self, key: &CacheKey) -> CacheResult<bool>;

    /// Move the stored bytes of `from` to `to` with the remaining TTL,
    /// leaving any herd wrapper as written. `false` when `from` is missing.
    async fn move_value(&self, from: &CacheKey, to: &CacheKey) -> CacheResult<bool>;

    /// Reset the expiry; `None` persists the key.
    async fn touch(&self, key: &CacheKey, ttl: Option<Duration>) -> CacheResult<bool>;

    /// Add `delta`. Fails with [`CacheError::KeyNotFound`] for a missing key
    /// unless `ignore_key_check` is set.
    async fn incr(&self, key: &CacheKey, delta: i64, ignore_key_check: bool) -> CacheResult<i64>;

    /// Subtract `delta`, same rules as [`CacheClient::incr`].
    async fn decr(&self, key: &CacheKey, delta: i64, ignore_key_check: bool) -> CacheResult<i64>;

    /// Fetch many keys with a non-transactional pipeline.
    async fn get_many(&self, keys: &[CacheKey]) -> CacheResult<Vec<Option<Vec<u8>>>>;

    /// Store many values with a non-transactional pipeline; a failure may
    /// leave some values written.
    async fn set_many(&self, items: Vec<(CacheKey, Vec<u8>)>, ttl: Option<Duration>) -> CacheResult<()>;

    /// Fetch many keys with one `MGET`.
    async fn mget(&self, keys: &[CacheKey]) -> CacheResult<Vec<Option<Vec<u8>>>>;

    /// Store many values with one `MSET`: all or none.
    async fn mset(&self, items: Vec<(CacheKey, Vec<u8>)>) -> CacheResult<()>;

    /// `MGET` per server, merged.
    async fn mget_nonatomic(&self, keys: &[CacheKey]) -> CacheResult<Vec<Option<Vec<u8>>>>;

    /// `MSET` per server.
    async fn mset_nonatomic(&self, items: Vec<(CacheKey, Vec<u8>)>) -> CacheResult<()>;

    /// Store values only where absent; true when every key was set.
    async fn msetnx(&self, items: Vec<(CacheKey, Vec<u8>)>) -> CacheResult<bool>;

    /// Delete keys matching a rendered glob in batches of `itersize`.
    async fn delete_pattern(&self, pattern: &str, itersize: usize) -> CacheResult<u64>;

    /// Lazily stream server keys matching a rendered glob.
    fn iter_keys(&self, pattern: &str, itersize: usize) -> BoxStream<'static, CacheResult<String>>;

    /// Server keys matching a rendered glob, fetched eagerly with `KEYS`.
    async fn keys(&self, pattern: &str) -> CacheResult<Vec<String>>;

    /// Flush every server.
    async fn clear(&self) -> CacheResult<()>;

    /// Lock named by `key` on the server that owns it.
    fn lock(&self, key: &CacheKey, options: LockOptions) -> Lock;

    /// Backend for writes (primary) or reads (a replica when available).
    fn get_client(&self, write: bool) -> CacheResult<Arc<dyn Backend>>;

    /// Backend for raw commands. The sharded client needs a key to pick one.
    fn raw_client(&self, key: Option<&CacheKey>) -> CacheResult<Arc<dyn Backend>>;

    /// Release every pooled connection.
    fn close(&self);

    /// Add set members; returns how many were new.
    async fn sadd(&self, key: &CacheKey, members: Vec<Vec<u8>>) -> CacheResult<u64>;

    /// Remove set members; returns how many were present.
    async fn srem(&self, key: &CacheKey, members: Vec<Vec<u8>>) -> CacheResult<u64>;

    /// All set members.
    async fn smembers(&self, key: &CacheKey) -> CacheResult<Vec<Vec<u8>>>;

    /// Set membership.
    async fn sismember(&self, key: &CacheKey, member: Vec<u8>) -> CacheResult<bool>;

    /// Set size.
    async fn scard(&self, key: &CacheKey) -> CacheResult<u64>;

    /// Set hash fields; returns how many were new.
    async fn hset(&self, key: &CacheKey, fields: Vec<(String, Vec<u8>)>) -> CacheResult<u64>;

    /// One hash field.
    async fn hget(&self, key: &CacheKey, field: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Delete hash fields; returns how many existed.
    async fn hdel(&self, key: &CacheKey, fields: Vec<String>) -> CacheResult<u64>;

    /// Number of hash fields.
    async fn hlen(&self, key: &CacheKey) -> CacheResult<u64>;

    /// Whether a hash field exists.
    async fn hexists(&self, key: &CacheKey, field: &str) -> CacheResult<bool>;

    /// Hash field names.
    async fn hkeys(&self, key: &CacheKey) -> CacheResult<Vec<String>>;
}

/// Registered client variants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ClientKind {
    /// Primary plus optional replicas.
    #[default]
    Default,
    /// Keys spread over independent servers.
    Sharded,
    /// Default routing with thundering-herd protection.
    Herd,
    /// Primary and replica discovered through sentinel.
    Sentinel,
}

impl ClientKind {
    /// All registered variants.
    pub const ALL: [ClientKind; 4] = [Self::Default, Self::Sharded, Self::Herd, Self::Sentinel];

    /// Registry name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Sharded => "sharded",
            Self::Herd => "herd",
            Self::Sentinel => "sentinel",
        }
    }

    /// Build the client for `servers`.
    ///
    /// `memory://<name>` servers are served in-process; anything else gets a
    /// pool from `factory`.
    pub fn build(
        &self,
        servers: &[String],
        options: &CacheOptions,
        factory: &Arc<dyn ConnectionFactory>,
    ) -> CacheResult<Arc<dyn CacheClient>> {
        if servers.is_empty() {
            return Err(CacheError::Config("LOCATION must name at least one server".into()));
        }
        let client: Arc<dyn CacheClient> = match self {
            Self::Default => Arc::new(Client::new(
                *self,
                Replicated::new(backends(servers, factory)?)?,
            )),
            Self::Herd => Arc::new(
                Client::new(*self, Replicated::new(backends(servers, factory)?)?)
                    .with_herd(HerdPolicy::new(options.cache_herd_timeout)),
            ),
            Self::Sharded => Arc::new(Client::new(*self, ShardRing::new(backends(servers, factory)?)?)),
            Self::Sentinel => {
                if options.connection.sentinels.is_empty() {
                    return Err(CacheError::Config("SENTINELS must be set for the sentinel client".into()));
                }
                if factory.pool_kind() != PoolKind::Sentinel {
                    return Err(CacheError::Config(
                        "CONNECTION_POOL_CLASS is not configured correctly: the sentinel client needs the sentinel factory and pool"
                            .into(),
                    ));
                }
                let urls = servers
                    .iter()
                    .map(|url| sentinel_urls(url))
                    .collect::<CacheResult<Vec<_>>>()?
                    .into_iter()
                    .flat_map(|(primary, replica)| [primary, replica])
                    .collect::<Vec<_>>();
                Arc::new(Client::new(*self, Replicated::new(backends(&urls, factory)?)?))
            }
        };
        Ok(client)
    }
}

fn backends(servers: &[String], factory: &Arc<dyn ConnectionFactory>) -> CacheResult<Vec<Arc<dyn Backend>>> {
    servers
        .iter()
        .map(|url| -> CacheResult<Arc<dyn Backend>> {
            match url.strip_prefix(MEMORY_SCHEME) {
                Some(name) => Ok(Arc::new(MemoryBackend::named(name))),
                None => Ok(Arc::new(PooledBackend::new(factory.connect(url)?))),
            }
        })
        .collect()
}

impl fmt::Display for ClientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ClientKind {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.rsplit('.').next().unwrap_or(s).to_ascii_lowercase();
        let name = name.strip_suffix("client").unwrap_or(&name);
        match name {
            "" | "default" => Ok(Self::Default),
            "shard" | "sharded" => Ok(Self::Sharded),
            "herd" => Ok(Self::Herd),
            "sentinel" => Ok(Self::Sentinel),
            _ => Err(CacheError::Config(format!("unknown CLIENT_CLASS '{}'", s))),
        }
    }
}

impl Serialize for ClientKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for ClientKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_kind_accepts_class_paths() {
        assert_eq!("django_valkey.client.DefaultClient".parse::<ClientKind>().unwrap(), ClientKind::Default);
        assert_eq!("ShardClient".parse::<ClientKind>().unwrap(), ClientKind::Sharded);
        assert_eq!("herd".parse::<ClientKind>().unwrap(), ClientKind::Herd);
        assert_eq!("SentinelClient".parse::<ClientKind>().unwrap(), ClientKind::Sentinel);
        assert!("cluster".parse::<ClientKind>().is_err());
    }

    #[test]
    fn test_client_kind_names_round_trip() {
        for kind in ClientKind::ALL {
            assert_eq!(kind.name().parse::<ClientKind>().unwrap(), kind);
        }
    }
}
