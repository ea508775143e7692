//! Cache configuration types.
//!
//! [`CacheConfig`] mirrors one entry of a cache settings mapping
//! (`LOCATION`, `TIMEOUT`, `KEY_PREFIX`, `VERSION`, `OPTIONS`) and
//! deserializes from it directly. [`CacheOptions`] holds the `OPTIONS`
//! mapping: connection and codec keys live side by side, as they do in
//! the settings file. `PICKLE_VERSION` and other unknown keys are ignored.

use crate::client::{ClientKind, DEFAULT_HERD_TIMEOUT};
use crate::error::{CacheError, CacheResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use valkey_cache_codec::CodecConfig;
use valkey_cache_pool::{ConnectionOptions, opt_secs_serde, secs_serde};

/// Default expiry for writes that do not name one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Default `SCAN COUNT` hint for `iter_keys` and `delete_pattern`.
pub const DEFAULT_SCAN_ITERSIZE: usize = 10;

/// Default server when none is configured.
pub const DEFAULT_LOCATION: &str = "valkey://127.0.0.1:6379/0";

/// Expiry requested by a write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Timeout {
    /// The cache's configured `TIMEOUT`.
    #[default]
    Default,
    /// Never expire.
    Never,
    /// Expire after this long; zero expires immediately.
    After(Duration),
}

impl Timeout {
    /// Expire after `secs` seconds.
    pub fn seconds(secs: u64) -> Self {
        Self::After(Duration::from_secs(secs))
    }

    /// Expire after `millis` milliseconds.
    pub fn millis(millis: u64) -> Self {
        Self::After(Duration::from_millis(millis))
    }

    /// Resolve against the cache default: `None` never expires.
    pub fn resolve(self, default: Option<Duration>) -> Option<Duration> {
        match self {
            Self::Default => default,
            Self::Never => None,
            Self::After(ttl) => Some(ttl),
        }
    }
}

impl From<Duration> for Timeout {
    fn from(ttl: Duration) -> Self {
        Self::After(ttl)
    }
}

impl From<Option<Duration>> for Timeout {
    fn from(ttl: Option<Duration>) -> Self {
        ttl.map_or(Self::Never, Self::After)
    }
}

/// The `OPTIONS` mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct CacheOptions {
    /// `CLIENT_CLASS`
    pub client_class: ClientKind,
    /// Connection keys (`CONNECTION_FACTORY`, `SOCKET_TIMEOUT`, `SENTINELS`, ...).
    #[serde(flatten)]
    pub connection: ConnectionOptions,
    /// Codec keys (`SERIALIZER`, `COMPRESSOR`, `COMPRESS_MIN_LENGTH`, ...).
    #[serde(flatten)]
    pub codec: CodecConfig,
    /// Turn connection errors into safe defaults.
    pub ignore_exceptions: bool,
    /// Log errors swallowed by `IGNORE_EXCEPTIONS`.
    pub log_ignored_exceptions: bool,
    /// Grace window of the herd client.
    #[serde(with = "secs_serde")]
    pub cache_herd_timeout: Duration,
    /// `SCAN COUNT` hint.
    #[serde(rename = "DJANGO_VALKEY_SCAN_ITERSIZE", alias = "SCAN_ITERSIZE")]
    pub scan_itersize: usize,
    /// Disconnect pools on `close`.
    pub close_connection: bool,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            client_class: ClientKind::default(),
            connection: ConnectionOptions::default(),
            codec: CodecConfig::default(),
            ignore_exceptions: false,
            log_ignored_exceptions: false,
            cache_herd_timeout: Duration::from_secs(DEFAULT_HERD_TIMEOUT),
            scan_itersize: DEFAULT_SCAN_ITERSIZE,
            close_connection: false,
        }
    }
}

/// One cache entry of the settings mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "SCREAMING_SNAKE_CASE")]
pub struct CacheConfig {
    /// Server URLs. Accepts a list or a comma separated string.
    #[serde(with = "location_serde")]
    pub location: Vec<String>,
    /// Default expiry; `null` never expires.
    #[serde(with = "opt_secs_serde")]
    pub timeout: Option<Duration>,
    /// Prefix rendered into every key.
    pub key_prefix: String,
    /// Default key version.
    pub version: i64,
    /// The `OPTIONS` mapping.
    pub options: CacheOptions,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            location: vec![DEFAULT_LOCATION.to_string()],
            timeout: Some(DEFAULT_TIMEOUT),
            key_prefix: String::new(),
            version: 1,
            options: CacheOptions::default(),
        }
    }
}

impl CacheConfig {
    /// Configuration for a single server.
    ///
    /// # Examples
    ///
    /// ```
    /// use valkey_cache_client::CacheConfig;
    ///
    /// let config = CacheConfig::new("valkey://localhost:6379/0").with_key_prefix("app");
    /// assert_eq!(config.location, vec!["valkey://localhost:6379/0"]);
    /// ```
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: split_location(&location.into()),
            ..Default::default()
        }
    }

    /// Configuration for several servers: a primary and replicas, or the
    /// shards of a sharded client.
    pub fn with_servers<I, S>(mut self, servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.location = servers.into_iter().map(Into::into).collect();
        self
    }

    /// Read overrides from `VALKEY_CACHE_*` environment variables:
    /// `LOCATION`, `KEY_PREFIX`, `VERSION`, `TIMEOUT` (seconds, `none` for
    /// no expiry), `CLIENT_CLASS`, `IGNORE_EXCEPTIONS`, plus the connection
    /// and codec variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.options.connection = ConnectionOptions::from_env();
        config.options.codec = CodecConfig::from_env();

        if let Ok(location) = std::env::var("VALKEY_CACHE_LOCATION") {
            config.location = split_location(&location);
        }

        if let Ok(prefix) = std::env::var("VALKEY_CACHE_KEY_PREFIX") {
            config.key_prefix = prefix;
        }

        if let Ok(version) = std::env::var("VALKEY_CACHE_VERSION")
            && let Ok(version) = version.parse() {
                config.version = version;
            }

        if let Ok(timeout) = std::env::var("VALKEY_CACHE_TIMEOUT") {
            if timeout.eq_ignore_ascii_case("none") {
                config.timeout = None;
            } else if let Ok(secs) = timeout.parse::<f64>()
                && let Ok(ttl) = Duration::try_from_secs_f64(secs) {
                    config.timeout = Some(ttl);
                }
        }

        if let Ok(class) = std::env::var("VALKEY_CACHE_CLIENT_CLASS")
            && let Ok(kind) = class.parse() {
                config.options.client_class = kind;
            }

        if let Ok(flag) = std::env::var("VALKEY_CACHE_IGNORE_EXCEPTIONS") {
            config.options.ignore_exceptions = matches!(flag.as_str(), "1" | "true" | "yes");
        }

        config
    }

    /// Set the key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set the default key version.
    pub fn with_version(mut self, version: i64) -> Self {
        self.version = version;
        self
    }

    /// Set the default expiry; `None` never expires.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Select the client variant.
    pub fn with_client(mut self, kind: ClientKind) -> Self {
        self.options.client_class = kind;
        self
    }

    /// Replace the `OPTIONS` mapping.
    pub fn with_options(mut self, options: CacheOptions) -> Self {
        self.options = options;
        self
    }

    /// Swallow connection errors, optionally logging them.
    pub fn ignore_exceptions(mut self, log: bool) -> Self {
        self.options.ignore_exceptions = true;
        self.options.log_ignored_exceptions = log;
        self
    }

    /// Check values that cannot be expressed by the types alone.
    pub fn validate(&self) -> CacheResult<()> {
        if self.location.is_empty() {
            return Err(CacheError::Config("LOCATION must name at least one server".into()));
        }
        if self.options.scan_itersize == 0 {
            return Err(CacheError::Config("DJANGO_VALKEY_SCAN_ITERSIZE must be positive".into()));
        }
        self.options.connection.validate()?;
        Ok(())
    }
}

fn split_location(location: &str) -> Vec<String> {
    location
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

mod location_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Location {
        One(String),
        Many(Vec<String>),
    }

    pub fn serialize<S>(location: &[String], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        location.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Location::deserialize(deserializer)? {
            Location::One(location) => super::split_location(&location),
            Location::Many(servers) => servers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use valkey_cache_codec::{CompressorKind, SerializerKind};
    use valkey_cache_pool::FactoryKind;

    #[test]
    fn test_defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.timeout, Some(DEFAULT_TIMEOUT));
        assert_eq!(config.version, 1);
        assert!(!config.options.ignore_exceptions);
        assert!(!config.options.close_connection);
        assert_eq!(config.options.scan_itersize, 10);
        assert_eq!(config.options.cache_herd_timeout, Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_settings_mapping() {
        let config: CacheConfig = serde_json::from_str(
            r#"{
                "LOCATION": "valkey://a:6379/0, valkey://b:6379/0",
                "TIMEOUT": null,
                "KEY_PREFIX": "shop",
                "OPTIONS": {
                    "CLIENT_CLASS": "django_valkey.client.ShardClient",
                    "SERIALIZER": "msgpack",
                    "COMPRESSOR": "zlib",
                    "SOCKET_TIMEOUT": 1.5,
                    "IGNORE_EXCEPTIONS": true,
                    "DJANGO_VALKEY_SCAN_ITERSIZE": 100,
                    "PICKLE_VERSION": -1
                }
            }"#,
        )
        .unwrap();

        assert_eq!(config.location, vec!["valkey://a:6379/0", "valkey://b:6379/0"]);
        assert_eq!(config.timeout, None);
        assert_eq!(config.key_prefix, "shop");
        assert_eq!(config.options.client_class, ClientKind::Sharded);
        assert_eq!(config.options.codec.serializer, SerializerKind::MsgPack);
        assert_eq!(config.options.codec.compressor, CompressorKind::Zlib);
        assert_eq!(config.options.connection.socket_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.options.connection.connection_factory, FactoryKind::Direct);
        assert!(config.options.ignore_exceptions);
        assert_eq!(config.options.scan_itersize, 100);
    }

    #[test]
    fn test_missing_timeout_uses_default() {
        let config: CacheConfig = serde_json::from_str(r#"{"LOCATION": ["memory://a"]}"#).unwrap();
        assert_eq!(config.timeout, Some(DEFAULT_TIMEOUT));
    }

    #[test]
    fn test_timeout_resolution() {
        let default = Some(DEFAULT_TIMEOUT);
        assert_eq!(Timeout::Default.resolve(default), default);
        assert_eq!(Timeout::Never.resolve(default), None);
        assert_eq!(Timeout::seconds(0).resolve(default), Some(Duration::ZERO));
        assert_eq!(Timeout::from(None), Timeout::Never);
    }

    #[test]
    fn test_validate_rejects_empty_location() {
        let config = CacheConfig::default().with_servers(Vec::<String>::new());
        assert!(matches!(config.validate(), Err(CacheError::Config(_))));
    }
}
