//! Connection factories.
//!
//! A factory turns a server URL into a memoized [`ConnectionPool`]. The
//! [`FactoryKind`] registry picks the implementation named by the
//! `CONNECTION_FACTORY` option.

use crate::params::ConnectionParams;
use crate::pool::{ConnectionPool, PooledValkeyConnection, ValkeyConnectionManager};
use crate::registry::PoolRegistry;
use crate::sentinel::SentinelResolver;
use crate::{ConnectionOptions, FactoryKind, PoolError, PoolKind, PoolResult};
use async_trait::async_trait;
use std::sync::Arc;

/// Builds pools and hands out connections.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Registry name.
    fn name(&self) -> &'static str;

    /// Parse `url`, applying option-level defaults such as `PASSWORD`.
    fn make_connection_params(&self, url: &str) -> PoolResult<ConnectionParams>;

    /// The pool for `params`, created on first use.
    fn get_or_create_pool(&self, params: &ConnectionParams) -> PoolResult<ConnectionPool>;

    /// Pool kind this factory produces.
    fn pool_kind(&self) -> PoolKind;

    /// Release every pool this factory created.
    fn disconnect(&self);

    /// Check out a connection for `params`.
    async fn get_connection(&self, params: &ConnectionParams) -> PoolResult<PooledValkeyConnection> {
        self.get_or_create_pool(params)?.get().await
    }

    /// Shorthand for parse-then-pool.
    fn connect(&self, url: &str) -> PoolResult<ConnectionPool> {
        let params = self.make_connection_params(url)?;
        self.get_or_create_pool(&params)
    }
}

/// Factory for directly addressed servers (TCP or Unix socket).
pub struct DirectFactory {
    options: ConnectionOptions,
    registry: Arc<PoolRegistry>,
}

impl DirectFactory {
    /// Create a direct factory sharing `registry`.
    pub fn new(options: ConnectionOptions, registry: Arc<PoolRegistry>) -> Self {
        Self { options, registry }
    }
}

#[async_trait]
impl ConnectionFactory for DirectFactory {
    fn name(&self) -> &'static str {
        FactoryKind::Direct.name()
    }

    fn make_connection_params(&self, url: &str) -> PoolResult<ConnectionParams> {
        Ok(ConnectionParams::parse(url)?
            .with_default_credentials(self.options.username.as_deref(), self.options.password.as_deref()))
    }

    fn get_or_create_pool(&self, params: &ConnectionParams) -> PoolResult<ConnectionPool> {
        self.registry.get_or_create(&params.canonical_key(), || {
            let manager =
                ValkeyConnectionManager::direct(params.clone(), self.options.socket_connect_timeout)?;
            Ok(ConnectionPool::new(
                manager,
                self.options.connection_pool_kwargs.clone(),
                self.options.socket_timeout,
            ))
        })
    }

    fn pool_kind(&self) -> PoolKind {
        PoolKind::Standard
    }

    fn disconnect(&self) {
        self.registry.disconnect();
    }
}

/// Factory for sentinel-managed services. The URL host names the service;
/// `is_master=0` in the query selects a replica.
pub struct SentinelFactory {
    options: ConnectionOptions,
    registry: Arc<PoolRegistry>,
    resolver: SentinelResolver,
}

impl SentinelFactory {
    /// Create a sentinel factory; fails without `SENTINELS`.
    pub fn new(options: ConnectionOptions, registry: Arc<PoolRegistry>) -> PoolResult<Self> {
        let resolver = SentinelResolver::new(options.sentinels.clone(), options.sentinel_kwargs.clone())?;
        Ok(Self {
            options,
            registry,
            resolver,
        })
    }

    /// The resolver pools use on every connect.
    pub fn resolver(&self) -> &SentinelResolver {
        &self.resolver
    }
}

#[async_trait]
impl ConnectionFactory for SentinelFactory {
    fn name(&self) -> &'static str {
        FactoryKind::Sentinel.name()
    }

    fn make_connection_params(&self, url: &str) -> PoolResult<ConnectionParams> {
        let params = ConnectionParams::parse(url)?
            .with_default_credentials(self.options.username.as_deref(), self.options.password.as_deref());
        if matches!(params.address(), crate::Address::Unix { .. }) {
            return Err(PoolError::Config(format!(
                "sentinel URLs must name a service, got socket {}",
                params
            )));
        }
        Ok(params)
    }

    fn get_or_create_pool(&self, params: &ConnectionParams) -> PoolResult<ConnectionPool> {
        self.registry.get_or_create(&params.canonical_key(), || {
            let manager = ValkeyConnectionManager::sentinel(
                params.clone(),
                self.resolver.clone(),
                self.options.socket_connect_timeout,
            );
            Ok(ConnectionPool::new(
                manager,
                self.options.connection_pool_kwargs.clone(),
                self.options.socket_timeout,
            ))
        })
    }

    fn pool_kind(&self) -> PoolKind {
        PoolKind::Sentinel
    }

    fn disconnect(&self) {
        self.registry.disconnect();
    }
}

impl FactoryKind {
    /// Instantiate the factory named by the options.
    pub fn build(
        &self,
        options: &ConnectionOptions,
        registry: Arc<PoolRegistry>,
    ) -> PoolResult<Arc<dyn ConnectionFactory>> {
        options.validate()?;
        match self {
            Self::Direct => Ok(Arc::new(DirectFactory::new(options.clone(), registry))),
            Self::Sentinel => {
                if options.connection_pool_class != PoolKind::Sentinel {
                    return Err(PoolError::Config(
                        "CONNECTION_POOL_CLASS is not configured correctly: sentinel factory needs the sentinel pool"
                            .to_string(),
                    ));
                }
                Ok(Arc::new(SentinelFactory::new(options.clone(), registry)?))
            }
        }
    }
}
