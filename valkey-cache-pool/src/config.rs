//! Connection and pool options.

use crate::{PoolError, PoolResult};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Which connection factory builds pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FactoryKind {
    /// Direct TCP / Unix socket connections.
    #[default]
    Direct,
    /// Sentinel-discovered primaries and replicas.
    Sentinel,
}

/// Which pool flavour backs each server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoolKind {
    /// Fixed address pool.
    #[default]
    Standard,
    /// Pool that re-resolves its address through sentinel on each connect.
    Sentinel,
}

impl FactoryKind {
    /// Registry name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Sentinel => "sentinel",
        }
    }
}

impl PoolKind {
    /// Registry name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Sentinel => "sentinel",
        }
    }
}

/// Lowercased last dotted segment: `a.b.SentinelConnectionPool` -> `sentinelconnectionpool`.
fn last_segment(name: &str) -> String {
    name.rsplit('.')
        .next()
        .unwrap_or(name)
        .replace(['_', '-'], "")
        .to_ascii_lowercase()
}

impl FromStr for FactoryKind {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match last_segment(s).as_str() {
            "direct" | "default" | "connectionfactory" => Ok(Self::Direct),
            "sentinel" | "sentinelconnectionfactory" => Ok(Self::Sentinel),
            _ => Err(PoolError::Config(format!("unknown connection factory '{}'", s))),
        }
    }
}

impl FromStr for PoolKind {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match last_segment(s).as_str() {
            "standard" | "default" | "connectionpool" | "blockingconnectionpool" => Ok(Self::Standard),
            "sentinel" | "sentinelconnectionpool" => Ok(Self::Sentinel),
            _ => Err(PoolError::Config(format!("unknown connection pool class '{}'", s))),
        }
    }
}

macro_rules! named_serde {
    ($ty:ty) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.name())
            }
        }

        impl Serialize for $ty {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.name())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let name = String::deserialize(deserializer)?;
                name.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

named_serde!(FactoryKind);
named_serde!(PoolKind);

/// Pool sizing (`CONNECTION_POOL_KWARGS`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Upper bound on live connections per pool.
    pub max_connections: u32,
    /// Idle connections kept open.
    pub min_idle: Option<u32>,
    /// Close connections idle for longer than this.
    #[serde(with = "opt_secs_serde")]
    pub idle_timeout: Option<Duration>,
    /// Recycle connections older than this.
    #[serde(with = "opt_secs_serde")]
    pub max_lifetime: Option<Duration>,
    /// How long a checkout waits for a free connection.
    #[serde(with = "secs_serde")]
    pub checkout_timeout: Duration,
    /// PING connections on checkout.
    pub test_on_check_out: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 50,
            min_idle: None,
            idle_timeout: Some(Duration::from_secs(600)),
            max_lifetime: None,
            checkout_timeout: Duration::from_secs(30),
            test_on_check_out: false,
        }
    }
}

impl PoolConfig {
    /// Set the connection limit.
    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the idle floor.
    pub fn min_idle(mut self, min_idle: u32) -> Self {
        self.min_idle = Some(min_idle);
        self
    }

    /// Set the checkout wait.
    pub fn checkout_timeout(mut self, timeout: Duration) -> Self {
        self.checkout_timeout = timeout;
        self
    }
}

/// A sentinel endpoint, written either as `"host:port"` or `["host", port]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SentinelAddr {
    /// Host
    pub host: String,
    /// Port
    pub port: u16,
}

impl SentinelAddr {
    /// Create a sentinel address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl FromStr for SentinelAddr {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| PoolError::Config(format!("sentinel address '{}' needs host:port", s)))?;
        let port = port
            .parse()
            .map_err(|_| PoolError::Config(format!("invalid sentinel port in '{}'", s)))?;
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for SentinelAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl Serialize for SentinelAddr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SentinelAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Pair(String, u16),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Pair(host, port) => Ok(Self::new(host, port)),
            Raw::Text(text) => text.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// Credentials and timeouts for talking to the sentinels themselves
/// (`SENTINEL_KWARGS`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SentinelKwargs {
    /// ACL user.
    pub username: Option<String>,
    /// Password.
    pub password: Option<String>,
    /// Connect timeout for sentinel queries.
    #[serde(with = "opt_secs_serde")]
    pub socket_timeout: Option<Duration>,
}

/// Connection options taken from the cache `OPTIONS` mapping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct ConnectionOptions {
    /// `CONNECTION_FACTORY`
    pub connection_factory: FactoryKind,
    /// `CONNECTION_POOL_CLASS`
    pub connection_pool_class: PoolKind,
    /// `CONNECTION_POOL_KWARGS`
    pub connection_pool_kwargs: PoolConfig,
    /// `SOCKET_TIMEOUT`: bound on every command.
    #[serde(with = "opt_secs_serde")]
    pub socket_timeout: Option<Duration>,
    /// `SOCKET_CONNECT_TIMEOUT`: bound on connection establishment.
    #[serde(with = "opt_secs_serde")]
    pub socket_connect_timeout: Option<Duration>,
    /// `USERNAME`, used when the URL carries none.
    pub username: Option<String>,
    /// `PASSWORD`, used when the URL carries none.
    pub password: Option<String>,
    /// `SENTINELS`
    pub sentinels: Vec<SentinelAddr>,
    /// `SENTINEL_KWARGS`
    pub sentinel_kwargs: SentinelKwargs,
}

impl ConnectionOptions {
    /// Create default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read overrides from `VALKEY_CACHE_*` environment variables.
    pub fn from_env() -> Self {
        let mut options = Self::default();

        if let Ok(factory) = std::env::var("VALKEY_CACHE_CONNECTION_FACTORY")
            && let Ok(kind) = factory.parse() {
                options.connection_factory = kind;
            }

        if let Ok(pool) = std::env::var("VALKEY_CACHE_CONNECTION_POOL_CLASS")
            && let Ok(kind) = pool.parse() {
                options.connection_pool_class = kind;
            }

        if let Ok(max) = std::env::var("VALKEY_CACHE_MAX_CONNECTIONS")
            && let Ok(max) = max.parse() {
                options.connection_pool_kwargs.max_connections = max;
            }

        if let Ok(secs) = std::env::var("VALKEY_CACHE_SOCKET_TIMEOUT")
            && let Ok(secs) = secs.parse::<f64>() {
                options.socket_timeout = Some(Duration::from_secs_f64(secs));
            }

        if let Ok(secs) = std::env::var("VALKEY_CACHE_SOCKET_CONNECT_TIMEOUT")
            && let Ok(secs) = secs.parse::<f64>() {
                options.socket_connect_timeout = Some(Duration::from_secs_f64(secs));
            }

        if let Ok(password) = std::env::var("VALKEY_CACHE_PASSWORD") {
            options.password = Some(password);
        }

        if let Ok(sentinels) = std::env::var("VALKEY_CACHE_SENTINELS") {
            options.sentinels = sentinels
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
        }

        options
    }

    /// Use the sentinel factory and pool with the given sentinels.
    pub fn with_sentinels(mut self, sentinels: Vec<SentinelAddr>) -> Self {
        self.sentinels = sentinels;
        self.connection_factory = FactoryKind::Sentinel;
        self.connection_pool_class = PoolKind::Sentinel;
        self
    }

    /// Set the command timeout.
    pub fn with_socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = Some(timeout);
        self
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.socket_connect_timeout = Some(timeout);
        self
    }

    /// Set pool sizing.
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.connection_pool_kwargs = pool;
        self
    }

    /// Set the default password.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Reject contradictory combinations.
    pub fn validate(&self) -> PoolResult<()> {
        if self.connection_factory == FactoryKind::Sentinel && self.sentinels.is_empty() {
            return Err(PoolError::Config(
                "SENTINELS must be provided as a list of (host, port)".to_string(),
            ));
        }
        if self.connection_pool_kwargs.max_connections == 0 {
            return Err(PoolError::Config("max_connections must be positive".to_string()));
        }
        Ok(())
    }
}

/// Durations as (fractional) seconds.
pub mod secs_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Optional durations as (fractional) seconds; `null` means unset.
pub mod opt_secs_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_secs_f64()).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<f64>::deserialize(deserializer)? {
            Some(secs) => Duration::try_from_secs_f64(secs)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_class_paths() {
        assert_eq!(
            "django_valkey.pool.SentinelConnectionFactory".parse::<FactoryKind>().unwrap(),
            FactoryKind::Sentinel
        );
        assert_eq!(
            "valkey.sentinel.SentinelConnectionPool".parse::<PoolKind>().unwrap(),
            PoolKind::Sentinel
        );
        assert_eq!("direct".parse::<FactoryKind>().unwrap(), FactoryKind::Direct);
        assert!("mystery".parse::<PoolKind>().is_err());
    }

    #[test]
    fn test_deserialize_options() {
        let options: ConnectionOptions = serde_json::from_str(
            r#"{
                "CONNECTION_FACTORY": "sentinel",
                "CONNECTION_POOL_CLASS": "sentinel",
                "CONNECTION_POOL_KWARGS": {"max_connections": 8},
                "SOCKET_TIMEOUT": 0.5,
                "SENTINELS": [["s1", 26379], "s2:26380"],
                "SENTINEL_KWARGS": {"password": "sentinel-pw"}
            }"#,
        )
        .unwrap();

        assert_eq!(options.connection_factory, FactoryKind::Sentinel);
        assert_eq!(options.connection_pool_kwargs.max_connections, 8);
        assert_eq!(options.socket_timeout, Some(Duration::from_millis(500)));
        assert_eq!(
            options.sentinels,
            vec![SentinelAddr::new("s1", 26379), SentinelAddr::new("s2", 26380)]
        );
        assert_eq!(options.sentinel_kwargs.password.as_deref(), Some("sentinel-pw"));
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_sentinel_factory_requires_sentinels() {
        let options = ConnectionOptions {
            connection_factory: FactoryKind::Sentinel,
            ..Default::default()
        };
        assert!(matches!(options.validate(), Err(PoolError::Config(_))));
    }

    #[test]
    fn test_sentinel_addr_parse() {
        let addr: SentinelAddr = "[::1]:26379".parse().unwrap();
        assert_eq!(addr.host, "[::1]");
        assert_eq!(addr.port, 26379);
        assert!("nohost".parse::<SentinelAddr>().is_err());
    }
}
