//! Pooled server connections.

use crate::params::ConnectionParams;
use crate::sentinel::SentinelResolver;
use crate::{PoolConfig, PoolError, PoolResult};
use bb8::{ErrorSink, ManageConnection, Pool, PooledConnection, RunError};
use parking_lot::{Mutex, RwLock};
use redis::aio::MultiplexedConnection;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// How the manager finds the server for a new connection.
#[derive(Debug, Clone)]
pub enum ConnectTarget {
    /// Fixed address.
    Direct(redis::Client),
    /// Address re-resolved through sentinel on every connect.
    Sentinel(SentinelResolver),
}

/// bb8 connection manager for Valkey connections.
#[derive(Debug, Clone)]
pub struct ValkeyConnectionManager {
    params: ConnectionParams,
    target: ConnectTarget,
    connect_timeout: Option<Duration>,
}

impl ValkeyConnectionManager {
    /// Manager connecting straight to the address in `params`.
    pub fn direct(params: ConnectionParams, connect_timeout: Option<Duration>) -> PoolResult<Self> {
        let client = redis::Client::open(params.connection_url())?;
        Ok(Self {
            params,
            target: ConnectTarget::Direct(client),
            connect_timeout,
        })
    }

    /// Manager resolving `params` (service name as host) through sentinel.
    pub fn sentinel(
        params: ConnectionParams,
        resolver: SentinelResolver,
        connect_timeout: Option<Duration>,
    ) -> Self {
        Self {
            params,
            target: ConnectTarget::Sentinel(resolver),
            connect_timeout,
        }
    }

    /// Parameters this manager connects with.
    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }

    async fn open(&self) -> PoolResult<MultiplexedConnection> {
        let client = match &self.target {
            ConnectTarget::Direct(client) => client.clone(),
            ConnectTarget::Sentinel(resolver) => {
                let resolved = resolver.resolve(&self.params).await?;
                redis::Client::open(resolved.connection_url())?
            }
        };

        let connecting = client.get_multiplexed_async_connection();
        match self.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, connecting)
                .await
                .map_err(|_| PoolError::Timeout(format!("connecting to {}", self.params)))?
                .map_err(PoolError::from),
            None => connecting.await.map_err(PoolError::from),
        }
    }
}

impl ManageConnection for ValkeyConnectionManager {
    type Connection = ValkeyConnection;
    type Error = PoolError;

    async fn connect(&self) -> Result<Self::Connection, Self::Error> {
        let conn = self.open().await?;
        debug!(server = %self.params, "Opened connection");
        Ok(ValkeyConnection {
            conn,
            broken: false,
        })
    }

    async fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        let pong: String = redis::cmd("PING").query_async(&mut conn.conn).await?;
        if pong == "PONG" {
            Ok(())
        } else {
            Err(PoolError::Connection(format!("unexpected PING reply '{}'", pong)))
        }
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        conn.broken
    }
}

/// A live server connection owned by a pool.
///
/// Mark it broken after a timeout or I/O failure so the pool discards it
/// instead of handing a desynchronized stream to the next caller.
pub struct ValkeyConnection {
    conn: MultiplexedConnection,
    broken: bool,
}

impl ValkeyConnection {
    /// Discard this connection when it is returned.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Whether the connection was marked broken.
    pub fn is_broken(&self) -> bool {
        self.broken
    }
}

impl Deref for ValkeyConnection {
    type Target = MultiplexedConnection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl DerefMut for ValkeyConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

/// A checked-out connection, exclusive to its holder until dropped.
pub type PooledValkeyConnection = PooledConnection<'static, ValkeyConnectionManager>;

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolState {
    /// Open connections.
    pub connections: u32,
    /// Open connections not checked out.
    pub idle_connections: u32,
}

/// Lazily connecting pool for one server.
///
/// Cloning is cheap and shares the underlying pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    manager: ValkeyConnectionManager,
    config: PoolConfig,
    socket_timeout: Option<Duration>,
    last_error: LastConnectError,
    pool: RwLock<Pool<ValkeyConnectionManager>>,
}

/// Keeps the most recent connect failure so a checkout that times out
/// waiting on a failing server reports why.
#[derive(Debug, Clone, Default)]
struct LastConnectError(Arc<Mutex<Option<String>>>);

impl ErrorSink<PoolError> for LastConnectError {
    fn sink(&self, error: PoolError) {
        *self.0.lock() = Some(error.to_string());
    }

    fn boxed_clone(&self) -> Box<dyn ErrorSink<PoolError>> {
        Box::new(self.clone())
    }
}

impl ConnectionPool {
    /// Create a pool. No connection is opened until the first checkout.
    pub fn new(
        manager: ValkeyConnectionManager,
        config: PoolConfig,
        socket_timeout: Option<Duration>,
    ) -> Self {
        let last_error = LastConnectError::default();
        let pool = build_pool(&manager, &config, &last_error);

        info!(
            server = %manager.params(),
            max_connections = config.max_connections,
            "Valkey connection pool created"
        );

        Self {
            inner: Arc::new(PoolInner {
                manager,
                config,
                socket_timeout,
                last_error,
                pool: RwLock::new(pool),
            }),
        }
    }

    /// Check out a connection.
    pub async fn get(&self) -> PoolResult<PooledValkeyConnection> {
        let pool = self.inner.pool.read().clone();
        match pool.get_owned().await {
            Ok(conn) => {
                self.inner.last_error.0.lock().take();
                Ok(conn)
            }
            Err(RunError::TimedOut) => match self.inner.last_error.0.lock().take() {
                Some(reason) => Err(PoolError::Connection(reason)),
                None => Err(RunError::<PoolError>::TimedOut.into()),
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Parameters of the server behind this pool.
    pub fn params(&self) -> &ConnectionParams {
        self.inner.manager.params()
    }

    /// Per-command timeout (`SOCKET_TIMEOUT`).
    pub fn socket_timeout(&self) -> Option<Duration> {
        self.inner.socket_timeout
    }

    /// Maximum number of live connections.
    pub fn max_connections(&self) -> u32 {
        self.inner.config.max_connections
    }

    /// Current occupancy.
    pub fn state(&self) -> PoolState {
        let state = self.inner.pool.read().state();
        PoolState {
            connections: state.connections,
            idle_connections: state.idle_connections,
        }
    }

    /// Release every pooled connection. Connections currently checked out
    /// are closed when returned; later checkouts open fresh connections.
    pub fn disconnect(&self) {
        let fresh = build_pool(&self.inner.manager, &self.inner.config, &self.inner.last_error);
        let old = std::mem::replace(&mut *self.inner.pool.write(), fresh);
        drop(old);
        info!(server = %self.params(), "Valkey connection pool disconnected");
    }

    /// Whether two handles share the same underlying pool.
    pub fn same_pool(&self, other: &ConnectionPool) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("server", &self.params().to_string())
            .field("max_connections", &self.inner.config.max_connections)
            .finish()
    }
}

fn build_pool(
    manager: &ValkeyConnectionManager,
    config: &PoolConfig,
    errors: &LastConnectError,
) -> Pool<ValkeyConnectionManager> {
    Pool::builder()
        .max_size(config.max_connections)
        .min_idle(config.min_idle)
        .idle_timeout(config.idle_timeout)
        .max_lifetime(config.max_lifetime)
        .connection_timeout(config.checkout_timeout)
        .test_on_check_out(config.test_on_check_out)
        .retry_connection(false)
        .error_sink(errors.boxed_clone())
        .build_unchecked(manager.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(url: &str) -> ConnectionPool {
        let params = ConnectionParams::parse(url).unwrap();
        let manager = ValkeyConnectionManager::direct(params, Some(Duration::from_millis(200))).unwrap();
        let config = PoolConfig::default()
            .max_connections(4)
            .checkout_timeout(Duration::from_millis(300));
        ConnectionPool::new(manager, config, None)
    }

    #[tokio::test]
    async fn test_pool_is_lazy() {
        let pool = pool("redis://127.0.0.1:1");
        assert_eq!(pool.state().connections, 0);
        assert_eq!(pool.max_connections(), 4);
    }

    #[tokio::test]
    async fn test_unreachable_server_is_connection_error() {
        let pool = pool("redis://127.0.0.1:1");
        let err = pool.get().await.err().unwrap();
        assert!(err.is_connection_error(), "{err:?}");
    }

    #[tokio::test]
    async fn test_disconnect_keeps_handles_usable() {
        let pool = pool("redis://127.0.0.1:1");
        let clone = pool.clone();
        pool.disconnect();
        assert!(pool.same_pool(&clone));
        assert_eq!(clone.state().connections, 0);
    }

    #[tokio::test]
    #[ignore = "requires Valkey"]
    async fn test_checkout_and_ping() {
        let pool = pool("redis://127.0.0.1:6379");
        let mut conn = pool.get().await.unwrap();
        let pong: String = redis::cmd("PING").query_async(&mut **conn).await.unwrap();
        assert_eq!(pong, "PONG");
    }
}
