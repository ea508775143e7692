//! The cache facade.
//!
//! [`Cache`] renders keys, encodes values with the configured codec and
//! drives a [`CacheClient`]. With `IGNORE_EXCEPTIONS` enabled, connection
//! and timeout errors become safe defaults (misses, `false`, `0`).

use crate::backend::{Backend, Condition};
use crate::client::CacheClient;
use crate::config::{CacheConfig, Timeout};
use crate::error::{CacheError, CacheResult};
use crate::key::{CacheKey, KeyFunc, KeyMaker, ReverseKeyFunc};
use crate::lock::{Lock, LockOptions};
use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{info, warn};
use valkey_cache_codec::Codec;
use valkey_cache_pool::PoolRegistry;

/// Options for a single write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Expiry.
    pub timeout: Timeout,
    /// Write condition.
    pub condition: Option<Condition>,
}

impl SetOptions {
    /// Unconditional write with the default expiry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the expiry.
    pub fn timeout(mut self, timeout: impl Into<Timeout>) -> Self {
        self.timeout = timeout.into();
        self
    }

    /// Write only when the key is absent.
    pub fn nx(mut self) -> Self {
        self.condition = Some(Condition::IfAbsent);
        self
    }

    /// Write only when the key exists.
    pub fn xx(mut self) -> Self {
        self.condition = Some(Condition::IfPresent);
        self
    }
}

struct Shared {
    client: Arc<dyn CacheClient>,
    codec: Codec,
    registry: Arc<PoolRegistry>,
    default_timeout: Option<Duration>,
    ignore_exceptions: bool,
    log_ignored_exceptions: bool,
    scan_itersize: usize,
    close_connection: bool,
}

/// Typed cache API.
///
/// Cloning is cheap; clones share connections.
#[derive(Clone)]
pub struct Cache {
    shared: Arc<Shared>,
    keys: KeyMaker,
}

/// Builds a [`Cache`] from a [`CacheConfig`] plus the pieces that cannot
/// be expressed in configuration.
pub struct CacheBuilder {
    config: CacheConfig,
    key_func: Option<KeyFunc>,
    reverse_key_func: Option<ReverseKeyFunc>,
    client: Option<Arc<dyn CacheClient>>,
    registry: Option<Arc<PoolRegistry>>,
}

impl CacheBuilder {
    /// Start from `config`.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            key_func: None,
            reverse_key_func: None,
            client: None,
            registry: None,
        }
    }

    /// Render keys with `key_func(key, prefix, version)`.
    pub fn key_func<F>(mut self, key_func: F) -> Self
    where
        F: Fn(&str, &str, i64) -> String + Send + Sync + 'static,
    {
        self.key_func = Some(Arc::new(key_func));
        self
    }

    /// Recover caller keys with `reverse(server_key)`.
    pub fn reverse_key_func<F>(mut self, reverse: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.reverse_key_func = Some(Arc::new(reverse));
        self
    }

    /// Use an existing client instead of building one from `CLIENT_CLASS`.
    pub fn client(mut self, client: Arc<dyn CacheClient>) -> Self {
        self.client = Some(client);
        self
    }

    /// Share a pool registry with other caches.
    pub fn registry(mut self, registry: Arc<PoolRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Build the cache. Pools are created here but connect lazily; this
    /// must run inside a Tokio runtime.
    pub fn build(self) -> CacheResult<Cache> {
        let config = self.config;
        config.validate()?;
        let options = &config.options;

        let codec = Codec::from_config(&options.codec)?;
        let registry = self.registry.unwrap_or_default();
        let client = match self.client {
            Some(client) => client,
            None => {
                let factory = options
                    .connection
                    .connection_factory
                    .build(&options.connection, registry.clone())?;
                options.client_class.build(&config.location, options, &factory)?
            }
        };

        let mut keys = KeyMaker::new(config.key_prefix.clone(), config.version);
        if let Some(key_func) = self.key_func {
            keys = keys.with_key_func(key_func);
        }
        if let Some(reverse) = self.reverse_key_func {
            keys = keys.with_reverse_key_func(reverse);
        }

        info!(
            client = %client.kind(),
            servers = config.location.len(),
            serializer = %codec.serializer(),
            "Cache initialized"
        );

        Ok(Cache {
            shared: Arc::new(Shared {
                client,
                codec,
                registry,
                default_timeout: config.timeout,
                ignore_exceptions: options.ignore_exceptions,
                log_ignored_exceptions: options.log_ignored_exceptions,
                scan_itersize: options.scan_itersize,
                close_connection: options.close_connection,
            }),
            keys,
        })
    }
}

impl Cache {
    /// Build a cache from configuration.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use valkey_cache_client::*;
    ///
    /// #[tokio::main]
    /// async fn main() -> CacheResult<()> {
    ///     let cache = Cache::new(CacheConfig::new("valkey://localhost:6379/0"))?;
    ///     cache.set("greeting", "hello", Timeout::seconds(60)).await?;
    ///     let greeting: Option<String> = cache.get("greeting").await?;
    ///     assert_eq!(greeting.as_deref(), Some("hello"));
    ///     Ok(())
    /// }
    /// ```
    pub fn new(config: CacheConfig) -> CacheResult<Self> {
        CacheBuilder::new(config).build()
    }

    /// Start a builder.
    pub fn builder(config: CacheConfig) -> CacheBuilder {
        CacheBuilder::new(config)
    }

    /// A view of this cache whose default key version is `version`.
    pub fn versioned(&self, version: i64) -> Self {
        Self {
            shared: self.shared.clone(),
            keys: self.keys.clone().with_version(version),
        }
    }

    /// The underlying client.
    pub fn client(&self) -> &Arc<dyn CacheClient> {
        &self.shared.client
    }

    /// The value codec.
    pub fn codec(&self) -> &Codec {
        &self.shared.codec
    }

    /// Key rendering settings.
    pub fn key_maker(&self) -> &KeyMaker {
        &self.keys
    }

    /// Expiry used by [`Timeout::Default`].
    pub fn default_timeout(&self) -> Option<Duration> {
        self.shared.default_timeout
    }

    /// Render a caller key.
    pub fn make_key(&self, key: &str) -> CacheKey {
        self.keys.make_key(key, None)
    }

    /// Render a caller glob pattern.
    pub fn make_pattern(&self, pattern: &str) -> String {
        self.keys.make_pattern(pattern, None)
    }

    fn ttl_of(&self, timeout: Timeout) -> Option<Duration> {
        timeout.resolve(self.shared.default_timeout)
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> CacheResult<Vec<u8>> {
        Ok(self.shared.codec.encode(value)?)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> CacheResult<T> {
        Ok(self.shared.codec.decode(bytes)?)
    }

    fn render_all<K: AsRef<str>>(&self, keys: &[K]) -> Vec<CacheKey> {
        keys.iter().map(|k| self.make_key(k.as_ref())).collect()
    }

    fn encode_all<K: AsRef<str>, T: Serialize>(&self, items: &[(K, T)]) -> CacheResult<Vec<(CacheKey, Vec<u8>)>> {
        items
            .iter()
            .map(|(key, value)| Ok((self.make_key(key.as_ref()), self.encode(value)?)))
            .collect()
    }

    fn decode_found<K: AsRef<str>, T: DeserializeOwned>(
        &self,
        keys: &[K],
        values: Vec<Option<Vec<u8>>>,
    ) -> CacheResult<HashMap<String, T>> {
        let mut found = HashMap::with_capacity(values.len());
        for (key, value) in keys.iter().zip(values) {
            if let Some(bytes) = value {
                found.insert(key.as_ref().to_string(), self.decode(&bytes)?);
            }
        }
        Ok(found)
    }

    /// Apply `IGNORE_EXCEPTIONS` to a result.
    fn guard<T>(&self, operation: &str, result: CacheResult<T>, fallback: impl FnOnce() -> T) -> CacheResult<T> {
        match result {
            Err(err) if self.shared.ignore_exceptions && err.is_connection_error() => {
                if self.shared.log_ignored_exceptions {
                    warn!(operation, error = %err, "Ignored cache connection error");
                }
                Ok(fallback())
            }
            other => other,
        }
    }

    /// Fetch and decode a value.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Option<T>> {
        let stored = self.guard("get", self.client().get(&self.make_key(key)).await, || None)?;
        stored.map(|bytes| self.decode(&bytes)).transpose()
    }

    /// Store a value.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        timeout: impl Into<Timeout>,
    ) -> CacheResult<bool> {
        self.set_with(key, value, SetOptions::new().timeout(timeout)).await
    }

    /// Store a value with explicit options.
    pub async fn set_with<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        options: SetOptions,
    ) -> CacheResult<bool> {
        let bytes = self.encode(value)?;
        let ttl = self.ttl_of(options.timeout);
        let result = self
            .client()
            .set(&self.make_key(key), bytes, ttl, options.condition)
            .await;
        self.guard("set", result, || false)
    }

    /// Store a value only when the key is absent.
    pub async fn add<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        timeout: impl Into<Timeout>,
    ) -> CacheResult<bool> {
        self.set_with(key, value, SetOptions::new().timeout(timeout).nx()).await
    }

    /// Return the cached value, or compute, store and return it.
    ///
    /// When another writer stores the key first, its value wins.
    pub async fn get_or_set<T, F, Fut>(&self, key: &str, timeout: impl Into<Timeout>, compute: F) -> CacheResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = CacheResult<T>>,
    {
        if let Some(value) = self.get(key).await? {
            return Ok(value);
        }
        let value = compute().await?;
        self.add(key, &value, timeout).await?;
        Ok(self.get(key).await?.unwrap_or(value))
    }

    /// Delete a key; returns whether it existed.
    pub async fn delete(&self, key: &str) -> CacheResult<bool> {
        let result = self.client().delete(&self.make_key(key)).await;
        self.guard("delete", result, || false)
    }

    /// Delete keys; returns how many existed.
    pub async fn delete_many<K: AsRef<str>>(&self, keys: &[K]) -> CacheResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let result = self.client().delete_many(&self.render_all(keys)).await;
        self.guard("delete_many", result, || 0)
    }

    /// Whether the key exists.
    pub async fn has_key(&self, key: &str) -> CacheResult<bool> {
        let result = self.client().has_key(&self.make_key(key)).await;
        self.guard("has_key", result, || false)
    }

    /// Remaining seconds: `Some(0)` for a missing key, `None` without expiry.
    pub async fn ttl(&self, key: &str) -> CacheResult<Option<u64>> {
        let result = self.client().ttl(&self.make_key(key)).await;
        self.guard("ttl", result, || None)
    }

    /// Remaining milliseconds, same conventions as [`Cache::ttl`].
    pub async fn pttl(&self, key: &str) -> CacheResult<Option<u64>> {
        let result = self.client().pttl(&self.make_key(key)).await;
        self.guard("pttl", result, || None)
    }

    /// Expire the key after `ttl` (whole seconds).
    pub async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<bool> {
        let result = self.client().expire(&self.make_key(key), ttl).await;
        self.guard("expire", result, || false)
    }

    /// Expire the key after `ttl` (whole milliseconds).
    pub async fn pexpire(&self, key: &str, ttl: Duration) -> CacheResult<bool> {
        let result = self.client().pexpire(&self.make_key(key), ttl).await;
        self.guard("pexpire", result, || false)
    }

    /// Expire the key at `when`.
    pub async fn expire_at(&self, key: &str, when: SystemTime) -> CacheResult<bool> {
        let result = self.client().expire_at(&self.make_key(key), when).await;
        self.guard("expire_at", result, || false)
    }

    /// Expire the key at `when`, millisecond precision.
    pub async fn pexpire_at(&self, key: &str, when: SystemTime) -> CacheResult<bool> {
        let result = self.client().pexpire_at(&self.make_key(key), when).await;
        self.guard("pexpire_at", result, || false)
    }

    /// Remove the key's expiry.
    pub async fn persist(&self, key: &str) -> CacheResult<bool> {
        let result = self.client().persist(&self.make_key(key)).await;
        self.guard("persist", result, || false)
    }

    /// Reset the key's expiry.
    pub async fn touch(&self, key: &str, timeout: impl Into<Timeout>) -> CacheResult<bool> {
        let ttl = self.ttl_of(timeout.into());
        let result = self.client().touch(&self.make_key(key), ttl).await;
        self.guard("touch", result, || false)
    }

    /// Add `delta` to an existing integer.
    pub async fn incr(&self, key: &str, delta: i64) -> CacheResult<i64> {
        let result = self.client().incr(&self.make_key(key), delta, false).await;
        self.guard("incr", result, || 0)
    }

    /// Add `delta`, starting from zero when the key is missing.
    pub async fn incr_unchecked(&self, key: &str, delta: i64) -> CacheResult<i64> {
        let result = self.client().incr(&self.make_key(key), delta, true).await;
        self.guard("incr", result, || 0)
    }

    /// Subtract `delta` from an existing integer.
    pub async fn decr(&self, key: &str, delta: i64) -> CacheResult<i64> {
        let result = self.client().decr(&self.make_key(key), delta, false).await;
        self.guard("decr", result, || 0)
    }

    /// Move a value to `version + delta`, keeping its TTL. Returns the new
    /// version.
    pub async fn incr_version(&self, key: &str, delta: i64, version: Option<i64>) -> CacheResult<i64> {
        let version = version.unwrap_or(self.keys.version());
        let new_version = version
            .checked_add(delta)
            .ok_or_else(|| CacheError::Command(format!("version {version} + {delta} overflows")))?;
        let old_key = self.keys.make_key(key, Some(version));
        let new_key = self.keys.make_key(key, Some(new_version));

        if !self.client().move_value(&old_key, &new_key).await? {
            return Err(CacheError::KeyNotFound(key.to_string()));
        }
        Ok(new_version)
    }

    /// Fetch many keys with a pipeline; missing keys are left out.
    pub async fn get_many<K: AsRef<str>, T: DeserializeOwned>(&self, keys: &[K]) -> CacheResult<HashMap<String, T>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let result = self.client().get_many(&self.render_all(keys)).await;
        let values = self.guard("get_many", result, Vec::new)?;
        self.decode_found(keys, values)
    }

    /// Store many values with a non-transactional pipeline. A failure may
    /// leave some of the values written.
    pub async fn set_many<K: AsRef<str>, T: Serialize>(
        &self,
        items: &[(K, T)],
        timeout: impl Into<Timeout>,
    ) -> CacheResult<()> {
        let encoded = self.encode_all(items)?;
        let ttl = self.ttl_of(timeout.into());
        let result = self.client().set_many(encoded, ttl).await;
        self.guard("set_many", result, || ())
    }

    /// Fetch many keys with one `MGET`.
    pub async fn mget<K: AsRef<str>, T: DeserializeOwned>(&self, keys: &[K]) -> CacheResult<HashMap<String, T>> {
        let result = self.client().mget(&self.render_all(keys)).await;
        let values = self.guard("mget", result, Vec::new)?;
        self.decode_found(keys, values)
    }

    /// Store many values with one `MSET`: all of them or none.
    pub async fn mset<K: AsRef<str>, T: Serialize>(&self, items: &[(K, T)]) -> CacheResult<()> {
        let encoded = self.encode_all(items)?;
        let result = self.client().mset(encoded).await;
        self.guard("mset", result, || ())
    }

    /// `MGET` per server, merged.
    pub async fn mget_nonatomic<K: AsRef<str>, T: DeserializeOwned>(
        &self,
        keys: &[K],
    ) -> CacheResult<HashMap<String, T>> {
        let result = self.client().mget_nonatomic(&self.render_all(keys)).await;
        let values = self.guard("mget_nonatomic", result, Vec::new)?;
        self.decode_found(keys, values)
    }

    /// `MSET` per server.
    pub async fn mset_nonatomic<K: AsRef<str>, T: Serialize>(&self, items: &[(K, T)]) -> CacheResult<()> {
        let encoded = self.encode_all(items)?;
        let result = self.client().mset_nonatomic(encoded).await;
        self.guard("mset_nonatomic", result, || ())
    }

    /// Store values only where absent; true when every key was set.
    pub async fn msetnx<K: AsRef<str>, T: Serialize>(&self, items: &[(K, T)]) -> CacheResult<bool> {
        let encoded = self.encode_all(items)?;
        let result = self.client().msetnx(encoded).await;
        self.guard("msetnx", result, || false)
    }

    /// Delete keys matching a caller glob; returns how many were deleted.
    pub async fn delete_pattern(&self, pattern: &str, itersize: Option<usize>) -> CacheResult<u64> {
        let itersize = itersize.unwrap_or(self.shared.scan_itersize);
        let result = self
            .client()
            .delete_pattern(&self.make_pattern(pattern), itersize)
            .await;
        self.guard("delete_pattern", result, || 0)
    }

    /// Lazily stream caller keys matching a glob.
    pub fn iter_keys(&self, pattern: &str, itersize: Option<usize>) -> BoxStream<'static, CacheResult<String>> {
        let itersize = itersize.unwrap_or(self.shared.scan_itersize);
        let keys = self.keys.clone();
        self.client()
            .iter_keys(&self.make_pattern(pattern), itersize)
            .map_ok(move |key| keys.reverse_key(&key))
            .boxed()
    }

    /// Caller keys matching a glob, fetched eagerly.
    pub async fn keys(&self, pattern: &str) -> CacheResult<Vec<String>> {
        let result = self.client().keys(&self.make_pattern(pattern)).await;
        let found = self.guard("keys", result, Vec::new)?;
        Ok(found.iter().map(|key| self.keys.reverse_key(key)).collect())
    }

    /// Flush every server this cache talks to.
    pub async fn clear(&self) -> CacheResult<bool> {
        let result = self.client().clear().await.map(|_| true);
        self.guard("clear", result, || false)
    }

    /// A lock named by a caller key.
    pub fn get_lock(&self, key: &str, options: LockOptions) -> Lock {
        self.client().lock(&self.make_key(key), options)
    }

    /// Backend for writes or reads.
    pub fn get_client(&self, write: bool) -> CacheResult<Arc<dyn Backend>> {
        self.client().get_client(write)
    }

    /// Backend for raw commands; the sharded client needs a key.
    pub fn raw_client(&self, key: Option<&str>) -> CacheResult<Arc<dyn Backend>> {
        let key = key.map(|k| self.make_key(k));
        self.client().raw_client(key.as_ref())
    }

    /// Release connections when `CLOSE_CONNECTION` is set.
    pub fn close(&self) {
        if self.shared.close_connection {
            self.client().close();
            self.shared.registry.disconnect();
        }
    }

    /// Add set members; returns how many were new.
    pub async fn sadd<T: Serialize>(&self, key: &str, members: &[T]) -> CacheResult<u64> {
        let members = members.iter().map(|m| self.encode(m)).collect::<CacheResult<Vec<_>>>()?;
        let result = self.client().sadd(&self.make_key(key), members).await;
        self.guard("sadd", result, || 0)
    }

    /// Remove set members; returns how many were present.
    pub async fn srem<T: Serialize>(&self, key: &str, members: &[T]) -> CacheResult<u64> {
        let members = members.iter().map(|m| self.encode(m)).collect::<CacheResult<Vec<_>>>()?;
        let result = self.client().srem(&self.make_key(key), members).await;
        self.guard("srem", result, || 0)
    }

    /// All set members.
    pub async fn smembers<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Vec<T>> {
        let result = self.client().smembers(&self.make_key(key)).await;
        let members = self.guard("smembers", result, Vec::new)?;
        members.iter().map(|m| self.decode(m)).collect()
    }

    /// Set membership.
    pub async fn sismember<T: Serialize + ?Sized>(&self, key: &str, member: &T) -> CacheResult<bool> {
        let member = self.encode(member)?;
        let result = self.client().sismember(&self.make_key(key), member).await;
        self.guard("sismember", result, || false)
    }

    /// Set size.
    pub async fn scard(&self, key: &str) -> CacheResult<u64> {
        let result = self.client().scard(&self.make_key(key)).await;
        self.guard("scard", result, || 0)
    }

    /// Set one hash field; returns whether it was new.
    pub async fn hset<T: Serialize + ?Sized>(&self, key: &str, field: &str, value: &T) -> CacheResult<bool> {
        let fields = vec![(field.to_string(), self.encode(value)?)];
        let result = self.client().hset(&self.make_key(key), fields).await.map(|n| n > 0);
        self.guard("hset", result, || false)
    }

    /// One hash field.
    pub async fn hget<T: DeserializeOwned>(&self, key: &str, field: &str) -> CacheResult<Option<T>> {
        let result = self.client().hget(&self.make_key(key), field).await;
        let stored = self.guard("hget", result, || None)?;
        stored.map(|bytes| self.decode(&bytes)).transpose()
    }

    /// Delete hash fields; returns how many existed.
    pub async fn hdel<F: AsRef<str>>(&self, key: &str, fields: &[F]) -> CacheResult<u64> {
        let fields = fields.iter().map(|f| f.as_ref().to_string()).collect();
        let result = self.client().hdel(&self.make_key(key), fields).await;
        self.guard("hdel", result, || 0)
    }

    /// Number of hash fields.
    pub async fn hlen(&self, key: &str) -> CacheResult<u64> {
        let result = self.client().hlen(&self.make_key(key)).await;
        self.guard("hlen", result, || 0)
    }

    /// Whether a hash field exists.
    pub async fn hexists(&self, key: &str, field: &str) -> CacheResult<bool> {
        let result = self.client().hexists(&self.make_key(key), field).await;
        self.guard("hexists", result, || false)
    }

    /// Hash field names.
    pub async fn hkeys(&self, key: &str) -> CacheResult<Vec<String>> {
        let result = self.client().hkeys(&self.make_key(key)).await;
        self.guard("hkeys", result, Vec::new)
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("client", &self.shared.client.kind())
            .field("keys", &self.keys)
            .field("codec", &self.shared.codec)
            .finish()
    }
}
