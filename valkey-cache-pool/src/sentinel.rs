//! Sentinel discovery.
//!
//! Every new connection asks the sentinels for the current address of the
//! service, so a failover is picked up as soon as the pool opens its next
//! connection.

use crate::params::{Address, ConnectionParams};
use crate::{PoolError, PoolResult, SentinelAddr, SentinelKwargs};
use rand::seq::IndexedRandom;
use redis::aio::MultiplexedConnection;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Replica flags that make a replica unusable.
const UNHEALTHY_FLAGS: [&str; 3] = ["s_down", "o_down", "disconnected"];

/// Resolves service names to server addresses through a set of sentinels.
#[derive(Debug, Clone)]
pub struct SentinelResolver {
    sentinels: Arc<Vec<SentinelAddr>>,
    kwargs: SentinelKwargs,
}

impl SentinelResolver {
    /// Create a resolver; at least one sentinel is required.
    pub fn new(sentinels: Vec<SentinelAddr>, kwargs: SentinelKwargs) -> PoolResult<Self> {
        if sentinels.is_empty() {
            return Err(PoolError::Config(
                "SENTINELS must be provided as a list of (host, port)".to_string(),
            ));
        }
        Ok(Self {
            sentinels: Arc::new(sentinels),
            kwargs,
        })
    }

    /// Configured sentinels.
    pub fn sentinels(&self) -> &[SentinelAddr] {
        &self.sentinels
    }

    /// Rewrite `params` (whose host is the service name) to point at the
    /// primary or a replica, depending on `is_master`.
    pub async fn resolve(&self, params: &ConnectionParams) -> PoolResult<ConnectionParams> {
        let service = match params.address() {
            Address::Tcp { host, .. } => host.as_str(),
            Address::Unix { .. } => {
                return Err(PoolError::Config(
                    "sentinel-managed servers must be addressed by service name".to_string(),
                ));
            }
        };

        let (host, port) = if params.wants_primary() {
            self.discover_primary(service).await?
        } else {
            self.discover_replica(service).await?
        };

        debug!(service = %service, host = %host, port = port, "Sentinel resolved server");
        Ok(params.with_address(Address::Tcp { host, port }))
    }

    /// Ask each sentinel in turn for the primary of `service`.
    pub async fn discover_primary(&self, service: &str) -> PoolResult<(String, u16)> {
        for sentinel in self.sentinels.iter() {
            let mut conn = match self.connect(sentinel).await {
                Ok(conn) => conn,
                Err(e) => {
                    debug!(sentinel = %sentinel, error = %e, "Sentinel unreachable");
                    continue;
                }
            };

            let reply: Result<Option<(String, u16)>, _> = redis::cmd("SENTINEL")
                .arg("get-master-addr-by-name")
                .arg(service)
                .query_async(&mut conn)
                .await;

            match reply {
                Ok(Some(addr)) => return Ok(addr),
                Ok(None) => debug!(sentinel = %sentinel, service = %service, "Sentinel does not know service"),
                Err(e) => debug!(sentinel = %sentinel, error = %e, "Sentinel query failed"),
            }
        }

        Err(PoolError::Sentinel(format!("no primary found for '{}'", service)))
    }

    /// Pick a random healthy replica of `service`, falling back to the
    /// primary when none is healthy.
    pub async fn discover_replica(&self, service: &str) -> PoolResult<(String, u16)> {
        for sentinel in self.sentinels.iter() {
            let Ok(mut conn) = self.connect(sentinel).await else {
                continue;
            };

            let reply: Result<Vec<HashMap<String, String>>, _> = redis::cmd("SENTINEL")
                .arg("replicas")
                .arg(service)
                .query_async(&mut conn)
                .await;

            let Ok(replicas) = reply else {
                continue;
            };

            let healthy = healthy_replicas(&replicas);
            if let Some(addr) = healthy.choose(&mut rand::rng()) {
                return Ok(addr.clone());
            }
            break;
        }

        debug!(service = %service, "No healthy replica, using primary");
        self.discover_primary(service).await
    }

    async fn connect(&self, sentinel: &SentinelAddr) -> PoolResult<MultiplexedConnection> {
        let params = ConnectionParams::tcp(sentinel.host.clone(), sentinel.port)
            .with_default_credentials(
                self.kwargs.username.as_deref(),
                self.kwargs.password.as_deref(),
            );

        let client = redis::Client::open(params.connection_url())?;
        let timeout = self.kwargs.socket_timeout.unwrap_or(Duration::from_secs(5));
        tokio::time::timeout(timeout, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| PoolError::Timeout(format!("connecting to sentinel {}", sentinel)))?
            .map_err(PoolError::from)
    }
}

/// Addresses of replicas whose flags mark them usable.
fn healthy_replicas(replicas: &[HashMap<String, String>]) -> Vec<(String, u16)> {
    replicas
        .iter()
        .filter(|r| {
            let flags = r.get("flags").map(String::as_str).unwrap_or("");
            !flags.split(',').any(|f| UNHEALTHY_FLAGS.contains(&f))
        })
        .filter_map(|r| {
            let ip = r.get("ip")?;
            let port = r.get("port")?.parse().ok()?;
            Some((ip.clone(), port))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replica(ip: &str, port: &str, flags: &str) -> HashMap<String, String> {
        HashMap::from([
            ("ip".to_string(), ip.to_string()),
            ("port".to_string(), port.to_string()),
            ("flags".to_string(), flags.to_string()),
        ])
    }

    #[test]
    fn test_requires_sentinels() {
        assert!(matches!(
            SentinelResolver::new(vec![], SentinelKwargs::default()),
            Err(PoolError::Config(_))
        ));
    }

    #[test]
    fn test_healthy_replicas_filters_flags() {
        let replicas = vec![
            replica("10.0.0.1", "6379", "slave"),
            replica("10.0.0.2", "6379", "slave,s_down"),
            replica("10.0.0.3", "6379", "slave,disconnected"),
            replica("10.0.0.4", "bad", "slave"),
        ];
        assert_eq!(healthy_replicas(&replicas), vec![("10.0.0.1".to_string(), 6379)]);
    }

    #[tokio::test]
    async fn test_unix_params_cannot_be_resolved() {
        let resolver =
            SentinelResolver::new(vec![SentinelAddr::new("localhost", 26379)], SentinelKwargs::default())
                .unwrap();
        let params = ConnectionParams::parse("unix:///tmp/valkey.sock").unwrap();
        assert!(matches!(resolver.resolve(&params).await, Err(PoolError::Config(_))));
    }

    #[tokio::test]
    #[ignore = "requires Valkey sentinel"]
    async fn test_discover_primary_live() {
        let resolver =
            SentinelResolver::new(vec![SentinelAddr::new("localhost", 26379)], SentinelKwargs::default())
                .unwrap();
        let (_, port) = resolver.discover_primary("mymaster").await.unwrap();
        assert!(port > 0);
    }
}
