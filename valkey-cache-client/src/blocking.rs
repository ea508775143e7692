//! Synchronous cache API.
//!
//! [`BlockingCache`] drives a [`Cache`] on a private current-thread Tokio
//! runtime. Do not use it from inside an async context; blocking on a
//! runtime from within another one panics.

use crate::cache::{Cache, CacheBuilder, SetOptions};
use crate::config::{CacheConfig, Timeout};
use crate::error::{CacheError, CacheResult};
use crate::lock::{Lock, LockGuard, LockOptions};
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::runtime::{Builder, Runtime};

/// Blocking wrapper around [`Cache`].
#[derive(Clone)]
pub struct BlockingCache {
    cache: Cache,
    runtime: Arc<Runtime>,
}

impl BlockingCache {
    /// Build a blocking cache from configuration.
    pub fn new(config: CacheConfig) -> CacheResult<Self> {
        Self::from_builder(CacheBuilder::new(config))
    }

    /// Build a blocking cache from a prepared builder.
    pub fn from_builder(builder: CacheBuilder) -> CacheResult<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| CacheError::Config(format!("failed to start runtime: {}", e)))?;
        let cache = {
            let _entered = runtime.enter();
            builder.build()?
        };
        Ok(Self {
            cache,
            runtime: Arc::new(runtime),
        })
    }

    /// The async cache behind this wrapper.
    pub fn inner(&self) -> &Cache {
        &self.cache
    }

    fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    /// Fetch and decode a value.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Option<T>> {
        self.block_on(self.cache.get(key))
    }

    /// Store a value.
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, timeout: impl Into<Timeout>) -> CacheResult<bool> {
        self.block_on(self.cache.set(key, value, timeout))
    }

    /// Store a value with explicit options.
    pub fn set_with<T: Serialize + ?Sized>(&self, key: &str, value: &T, options: SetOptions) -> CacheResult<bool> {
        self.block_on(self.cache.set_with(key, value, options))
    }

    /// Store a value only when the key is absent.
    pub fn add<T: Serialize + ?Sized>(&self, key: &str, value: &T, timeout: impl Into<Timeout>) -> CacheResult<bool> {
        self.block_on(self.cache.add(key, value, timeout))
    }

    /// Return the cached value, or compute, store and return it.
    pub fn get_or_set<T, F>(&self, key: &str, timeout: impl Into<Timeout>, compute: F) -> CacheResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> CacheResult<T>,
    {
        self.block_on(self.cache.get_or_set(key, timeout, || async move { compute() }))
    }

    /// Delete a key.
    pub fn delete(&self, key: &str) -> CacheResult<bool> {
        self.block_on(self.cache.delete(key))
    }

    /// Delete keys.
    pub fn delete_many<K: AsRef<str>>(&self, keys: &[K]) -> CacheResult<u64> {
        self.block_on(self.cache.delete_many(keys))
    }

    /// Whether the key exists.
    pub fn has_key(&self, key: &str) -> CacheResult<bool> {
        self.block_on(self.cache.has_key(key))
    }

    /// Remaining seconds.
    pub fn ttl(&self, key: &str) -> CacheResult<Option<u64>> {
        self.block_on(self.cache.ttl(key))
    }

    /// Remaining milliseconds.
    pub fn pttl(&self, key: &str) -> CacheResult<Option<u64>> {
        self.block_on(self.cache.pttl(key))
    }

    pub fn expire(&self, key: &str, ttl: Duration) -> CacheResult<bool> {
        self.block_on(self.cache.expire(key, ttl))
    }

    pub fn pexpire(&self, key: &str, ttl: Duration) -> CacheResult<bool> {
        self.block_on(self.cache.pexpire(key, ttl))
    }

    pub fn expire_at(&self, key: &str, when: SystemTime) -> CacheResult<bool> {
        self.block_on(self.cache.expire_at(key, when))
    }

    pub fn pexpire_at(&self, key: &str, when: SystemTime) -> CacheResult<bool> {
        self.block_on(self.cache.pexpire_at(key, when))
    }

    pub fn persist(&self, key: &str) -> CacheResult<bool> {
        self.block_on(self.cache.persist(key))
    }

    pub fn touch(&self, key: &str, timeout: impl Into<Timeout>) -> CacheResult<bool> {
        self.block_on(self.cache.touch(key, timeout))
    }

    pub fn incr(&self, key: &str, delta: i64) -> CacheResult<i64> {
        self.block_on(self.cache.incr(key, delta))
    }

    pub fn incr_unchecked(&self, key: &str, delta: i64) -> CacheResult<i64> {
        self.block_on(self.cache.incr_unchecked(key, delta))
    }

    pub fn decr(&self, key: &str, delta: i64) -> CacheResult<i64> {
        self.block_on(self.cache.decr(key, delta))
    }

    pub fn incr_version(&self, key: &str, delta: i64, version: Option<i64>) -> CacheResult<i64> {
        self.block_on(self.cache.incr_version(key, delta, version))
    }

    pub fn get_many<K: AsRef<str>, T: DeserializeOwned>(&self, keys: &[K]) -> CacheResult<HashMap<String, T>> {
        self.block_on(self.cache.get_many(keys))
    }

    pub fn set_many<K: AsRef<str>, T: Serialize>(&self, items: &[(K, T)], timeout: impl Into<Timeout>) -> CacheResult<()> {
        self.block_on(self.cache.set_many(items, timeout))
    }

    pub fn mget<K: AsRef<str>, T: DeserializeOwned>(&self, keys: &[K]) -> CacheResult<HashMap<String, T>> {
        self.block_on(self.cache.mget(keys))
    }

    pub fn mset<K: AsRef<str>, T: Serialize>(&self, items: &[(K, T)]) -> CacheResult<()> {
        self.block_on(self.cache.mset(items))
    }

    pub fn mget_nonatomic<K: AsRef<str>, T: DeserializeOwned>(&self, keys: &[K]) -> CacheResult<HashMap<String, T>> {
        self.block_on(self.cache.mget_nonatomic(keys))
    }

    pub fn mset_nonatomic<K: AsRef<str>, T: Serialize>(&self, items: &[(K, T)]) -> CacheResult<()> {
        self.block_on(self.cache.mset_nonatomic(items))
    }

    pub fn msetnx<K: AsRef<str>, T: Serialize>(&self, items: &[(K, T)]) -> CacheResult<bool> {
        self.block_on(self.cache.msetnx(items))
    }

    /// Delete keys matching a caller glob.
    pub fn delete_pattern(&self, pattern: &str, itersize: Option<usize>) -> CacheResult<u64> {
        self.block_on(self.cache.delete_pattern(pattern, itersize))
    }

    /// Lazily iterate caller keys matching a glob.
    pub fn iter_keys(&self, pattern: &str, itersize: Option<usize>) -> KeyIter {
        KeyIter {
            stream: self.cache.iter_keys(pattern, itersize),
            runtime: self.runtime.clone(),
        }
    }

    /// Caller keys matching a glob.
    pub fn keys(&self, pattern: &str) -> CacheResult<Vec<String>> {
        self.block_on(self.cache.keys(pattern))
    }

    /// Flush every server.
    pub fn clear(&self) -> CacheResult<bool> {
        self.block_on(self.cache.clear())
    }

    /// A lock named by a caller key.
    pub fn get_lock(&self, key: &str, options: LockOptions) -> BlockingLock {
        BlockingLock {
            lock: self.cache.get_lock(key, options),
            runtime: self.runtime.clone(),
        }
    }

    /// Release connections when `CLOSE_CONNECTION` is set.
    pub fn close(&self) {
        let _entered = self.runtime.enter();
        self.cache.close();
    }

    pub fn sadd<T: Serialize>(&self, key: &str, members: &[T]) -> CacheResult<u64> {
        self.block_on(self.cache.sadd(key, members))
    }

    pub fn srem<T: Serialize>(&self, key: &str, members: &[T]) -> CacheResult<u64> {
        self.block_on(self.cache.srem(key, members))
    }

    pub fn smembers<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Vec<T>> {
        self.block_on(self.cache.smembers(key))
    }

    pub fn sismember<T: Serialize + ?Sized>(&self, key: &str, member: &T) -> CacheResult<bool> {
        self.block_on(self.cache.sismember(key, member))
    }

    pub fn scard(&self, key: &str) -> CacheResult<u64> {
        self.block_on(self.cache.scard(key))
    }

    pub fn hset<T: Serialize + ?Sized>(&self, key: &str, field: &str, value: &T) -> CacheResult<bool> {
        self.block_on(self.cache.hset(key, field, value))
    }

    pub fn hget<T: DeserializeOwned>(&self, key: &str, field: &str) -> CacheResult<Option<T>> {
        self.block_on(self.cache.hget(key, field))
    }

    pub fn hdel<F: AsRef<str>>(&self, key: &str, fields: &[F]) -> CacheResult<u64> {
        self.block_on(self.cache.hdel(key, fields))
    }

    pub fn hlen(&self, key: &str) -> CacheResult<u64> {
        self.block_on(self.cache.hlen(key))
    }

    pub fn hexists(&self, key: &str, field: &str) -> CacheResult<bool> {
        self.block_on(self.cache.hexists(key, field))
    }

    pub fn hkeys(&self, key: &str) -> CacheResult<Vec<String>> {
        self.block_on(self.cache.hkeys(key))
    }
}

impl std::fmt::Debug for BlockingCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingCache").field("cache", &self.cache).finish()
    }
}

/// Iterator over keys, fetched in `SCAN` batches on demand.
pub struct KeyIter {
    stream: BoxStream<'static, CacheResult<String>>,
    runtime: Arc<Runtime>,
}

impl Iterator for KeyIter {
    type Item = CacheResult<String>;

    fn next(&mut self) -> Option<Self::Item> {
        self.runtime.block_on(self.stream.next())
    }
}

/// Blocking counterpart of [`Lock`].
#[derive(Clone)]
pub struct BlockingLock {
    lock: Lock,
    runtime: Arc<Runtime>,
}

impl BlockingLock {
    /// Lock name on the server.
    pub fn name(&self) -> &str {
        self.lock.name()
    }

    /// Make one acquisition attempt.
    pub fn try_acquire(&self) -> CacheResult<Option<BlockingLockGuard>> {
        let guard = self.runtime.block_on(self.lock.try_acquire())?;
        Ok(guard.map(|guard| self.wrap(guard)))
    }

    /// Acquire the lock, waiting as the options allow.
    pub fn acquire(&self) -> CacheResult<BlockingLockGuard> {
        let guard = self.runtime.block_on(self.lock.acquire())?;
        Ok(self.wrap(guard))
    }

    /// Run `f` while holding the lock; the lock is always released.
    pub fn with_lock<T>(&self, f: impl FnOnce() -> CacheResult<T>) -> CacheResult<T> {
        let guard = self.acquire()?;
        let result = f();
        let released = guard.release();
        let value = result?;
        released?;
        Ok(value)
    }

    /// Whether anyone holds the lock.
    pub fn is_locked(&self) -> CacheResult<bool> {
        self.runtime.block_on(self.lock.is_locked())
    }

    fn wrap(&self, guard: LockGuard) -> BlockingLockGuard {
        BlockingLockGuard {
            guard: Some(guard),
            runtime: self.runtime.clone(),
        }
    }
}

impl std::fmt::Debug for BlockingLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingLock").field("lock", &self.lock).finish()
    }
}

/// A held lock; released when dropped.
pub struct BlockingLockGuard {
    guard: Option<LockGuard>,
    runtime: Arc<Runtime>,
}

impl BlockingLockGuard {
    /// Release the lock.
    pub fn release(mut self) -> CacheResult<()> {
        match self.guard.take() {
            Some(guard) => self.runtime.block_on(guard.release()),
            None => Ok(()),
        }
    }

    /// Reset the lock TTL.
    pub fn extend(&self, ttl: Duration) -> CacheResult<()> {
        match &self.guard {
            Some(guard) => self.runtime.block_on(guard.extend(ttl)),
            None => Err(CacheError::LockNotHeld("released".into())),
        }
    }

    /// Whether the server still holds this guard's token.
    pub fn is_owned(&self) -> CacheResult<bool> {
        match &self.guard {
            Some(guard) => self.runtime.block_on(guard.is_owned()),
            None => Ok(false),
        }
    }
}

impl Drop for BlockingLockGuard {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.take()
            && let Err(e) = self.runtime.block_on(guard.release())
        {
            tracing::error!(error = %e, "Failed to release lock on drop");
        }
    }
}

impl std::fmt::Debug for BlockingLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingLockGuard").field("guard", &self.guard).finish()
    }
}
