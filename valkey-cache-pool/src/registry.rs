//! Owned pool memoization.

use crate::pool::ConnectionPool;
use crate::PoolResult;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::info;

/// Pools memoized by the canonical key of their connection parameters.
///
/// One registry is created per cache client set and shared by its factory;
/// [`PoolRegistry::disconnect`] tears every pool down.
#[derive(Debug, Default)]
pub struct PoolRegistry {
    pools: Mutex<HashMap<String, ConnectionPool>>,
}

impl PoolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the pool registered under `key`, creating it with `create`
    /// on first use.
    pub fn get_or_create<F>(&self, key: &str, create: F) -> PoolResult<ConnectionPool>
    where
        F: FnOnce() -> PoolResult<ConnectionPool>,
    {
        let mut pools = self.pools.lock();
        if let Some(pool) = pools.get(key) {
            return Ok(pool.clone());
        }
        let pool = create()?;
        pools.insert(key.to_string(), pool.clone());
        Ok(pool)
    }

    /// Look up an existing pool.
    pub fn get(&self, key: &str) -> Option<ConnectionPool> {
        self.pools.lock().get(key).cloned()
    }

    /// Number of memoized pools.
    pub fn len(&self) -> usize {
        self.pools.lock().len()
    }

    /// Whether no pool has been created yet.
    pub fn is_empty(&self) -> bool {
        self.pools.lock().is_empty()
    }

    /// Release every pooled connection and forget all pools.
    pub fn disconnect(&self) {
        let pools: Vec<ConnectionPool> = self.pools.lock().drain().map(|(_, p)| p).collect();
        let count = pools.len();
        for pool in pools {
            pool.disconnect();
        }
        info!(pools = count, "Pool registry disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ConnectionParams;
    use crate::pool::ValkeyConnectionManager;
    use crate::{PoolConfig, PoolError};

    fn create(url: &str) -> PoolResult<ConnectionPool> {
        let params = ConnectionParams::parse(url)?;
        let manager = ValkeyConnectionManager::direct(params, None)?;
        Ok(ConnectionPool::new(manager, PoolConfig::default(), None))
    }

    #[tokio::test]
    async fn test_memoizes_by_key() {
        let registry = PoolRegistry::new();
        let a = registry.get_or_create("k", || create("redis://localhost")).unwrap();
        let b = registry
            .get_or_create("k", || Err(PoolError::Config("must not be called".into())))
            .unwrap();
        assert!(a.same_pool(&b));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_creation_is_not_cached() {
        let registry = PoolRegistry::new();
        assert!(registry.get_or_create("k", || create("http://nope")).is_err());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_clears() {
        let registry = PoolRegistry::new();
        registry.get_or_create("a", || create("redis://localhost/0")).unwrap();
        registry.get_or_create("b", || create("redis://localhost/1")).unwrap();
        registry.disconnect();
        assert!(registry.is_empty());
        assert!(registry.get("a").is_none());
    }
}
