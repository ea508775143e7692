//! Integration tests for valkey-cache-client.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use valkey_cache_client::*;
use valkey_cache_pool::SentinelAddr;

fn cache_on(backend: &Arc<MemoryBackend>, config: CacheConfig) -> Cache {
    let nodes: Vec<Arc<dyn Backend>> = vec![backend.clone()];
    let client = Client::new(ClientKind::Default, Replicated::new(nodes).unwrap());
    Cache::builder(config).client(Arc::new(client)).build().unwrap()
}

fn memory_cache(config: CacheConfig) -> (Cache, Arc<MemoryBackend>) {
    let backend = Arc::new(MemoryBackend::named("it"));
    (cache_on(&backend, config), backend)
}

fn sharded_cache(shards: usize) -> (Cache, Vec<Arc<MemoryBackend>>) {
    let backends: Vec<Arc<MemoryBackend>> = (0..shards)
        .map(|i| Arc::new(MemoryBackend::named(format!("shard{i}"))))
        .collect();
    let nodes = backends.iter().map(|b| b.clone() as Arc<dyn Backend>).collect();
    let client = Client::new(ClientKind::Sharded, ShardRing::new(nodes).unwrap());
    let cache = Cache::builder(CacheConfig::new("memory://unused"))
        .client(Arc::new(client))
        .build()
        .unwrap();
    (cache, backends)
}

fn config() -> CacheConfig {
    CacheConfig::new("memory://it").with_key_prefix("test")
}

#[tokio::test(start_paused = true)]
async fn test_ttl_expire_and_pexpire() {
    let (cache, _) = memory_cache(config());

    cache.set("foo", "bar", Timeout::seconds(22)).await.unwrap();
    assert_eq!(cache.ttl("foo").await.unwrap(), Some(22));

    assert!(cache.expire("foo", Duration::from_secs(5)).await.unwrap());
    assert_eq!(cache.ttl("foo").await.unwrap(), Some(5));

    assert!(cache.pexpire("foo", Duration::from_millis(5505)).await.unwrap());
    assert_eq!(cache.pttl("foo").await.unwrap(), Some(5505));
}

#[tokio::test(start_paused = true)]
async fn test_ttl_conventions() {
    let (cache, _) = memory_cache(config());

    cache.set("k", &1i64, Timeout::seconds(25)).await.unwrap();
    let ttl = cache.ttl("k").await.unwrap().unwrap();
    assert!(ttl > 0 && ttl <= 25);

    assert!(cache.persist("k").await.unwrap());
    assert_eq!(cache.ttl("k").await.unwrap(), None);
    assert_eq!(cache.ttl("missing").await.unwrap(), Some(0));

    cache.set("never", "x", Timeout::Never).await.unwrap();
    assert_eq!(cache.ttl("never").await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn test_default_timeout_and_expiry() {
    let (cache, _) = memory_cache(config().with_timeout(Some(Duration::from_secs(2))));

    cache.set("short", "lived", Timeout::Default).await.unwrap();
    assert_eq!(cache.ttl("short").await.unwrap(), Some(2));

    tokio::time::advance(Duration::from_secs(3)).await;
    assert_eq!(cache.get::<String>("short").await.unwrap(), None);
}

#[tokio::test]
async fn test_zero_timeout_deletes() {
    let (cache, _) = memory_cache(config());
    cache.set("k", "v", Timeout::Never).await.unwrap();
    cache.set("k", "v2", Timeout::seconds(0)).await.unwrap();
    assert!(!cache.has_key("k").await.unwrap());
}

#[tokio::test]
async fn test_set_nx() {
    let (cache, _) = memory_cache(config());

    assert!(cache.set_with("key", "value1", SetOptions::new().nx()).await.unwrap());
    assert!(!cache.set_with("key", "value2", SetOptions::new().nx()).await.unwrap());
    assert_eq!(cache.get::<String>("key").await.unwrap().as_deref(), Some("value1"));

    assert!(!cache.set_with("other", "v", SetOptions::new().xx()).await.unwrap());
    assert!(!cache.add("key", "value3", Timeout::Default).await.unwrap());
}

#[tokio::test]
async fn test_delete_pattern_and_keys() {
    let (cache, _) = memory_cache(config());
    for key in ["foo_1", "foo_2", "bar_1"] {
        cache.set(key, "v", Timeout::Never).await.unwrap();
    }

    assert_eq!(cache.delete_pattern("foo_*", None).await.unwrap(), 2);
    assert!(cache.keys("foo_*").await.unwrap().is_empty());
    assert_eq!(cache.keys("*").await.unwrap(), vec!["bar_1"]);
}

#[tokio::test]
async fn test_delete_pattern_larger_than_itersize() {
    let (cache, backend) = memory_cache(config());
    for i in 0..25 {
        cache.set(&format!("foo_{i}"), "v", Timeout::Never).await.unwrap();
    }
    cache.set("bar", "v", Timeout::Never).await.unwrap();

    assert_eq!(cache.delete_pattern("foo_*", Some(10)).await.unwrap(), 25);
    assert!(cache.keys("foo_*").await.unwrap().is_empty());
    assert_eq!(backend.len(), 1);
}

#[tokio::test]
async fn test_iter_keys_while_deleting_seen_keys() {
    use futures::StreamExt;

    let (cache, backend) = memory_cache(config());
    for i in 0..20 {
        cache.set(&format!("item:{i:02}"), &i, Timeout::Never).await.unwrap();
    }

    let mut stream = cache.iter_keys("item:*", Some(3));
    let mut seen = Vec::new();
    while let Some(key) = stream.next().await {
        let key = key.unwrap();
        assert!(cache.delete(&key).await.unwrap());
        seen.push(key);
    }

    assert_eq!(seen.len(), 20);
    assert!(backend.is_empty());
}

#[tokio::test]
async fn test_prefix_with_glob_characters_is_escaped() {
    let (cache, backend) = memory_cache(CacheConfig::new("memory://it").with_key_prefix("a*"));
    let other = cache_on(&backend, CacheConfig::new("memory://it").with_key_prefix("ab"));
    cache.set("k", "v", Timeout::Never).await.unwrap();
    other.set("k", "v", Timeout::Never).await.unwrap();

    assert_eq!(cache.keys("*").await.unwrap(), vec!["k"]);
    assert_eq!(cache.delete_pattern("*", None).await.unwrap(), 1);
    assert!(other.has_key("k").await.unwrap());
}

#[tokio::test]
async fn test_set_many_is_not_atomic() {
    let (cache, backend) = memory_cache(config());

    backend.fail_after(1);
    let err = cache
        .set_many(&[("a", 1i64), ("b", 2)], Timeout::Never)
        .await
        .unwrap_err();
    assert!(err.is_connection_error());
    backend.clear_faults();

    assert_eq!(cache.get::<i64>("a").await.unwrap(), Some(1));
    assert_eq!(cache.get::<i64>("b").await.unwrap(), None);
}

#[tokio::test]
async fn test_mset_is_all_or_nothing() {
    let (cache, backend) = memory_cache(config());

    backend.fail_after(1);
    cache.mset(&[("a", 1i64), ("b", 2)]).await.unwrap();
    backend.clear_faults();
    let both: std::collections::HashMap<String, i64> = cache.mget(&["a", "b"]).await.unwrap();
    assert_eq!(both.len(), 2);

    cache.clear().await.unwrap();
    backend.fail_after(0);
    assert!(cache.mset(&[("a", 1i64), ("b", 2)]).await.is_err());
    backend.clear_faults();
    let neither: std::collections::HashMap<String, i64> = cache.mget(&["a", "b"]).await.unwrap();
    assert!(neither.is_empty());
}

#[tokio::test]
async fn test_get_many_skips_missing() {
    let (cache, _) = memory_cache(config());
    cache.set_many(&[("x", "1"), ("y", "2")], Timeout::Never).await.unwrap();

    let found: std::collections::HashMap<String, String> = cache.get_many(&["x", "y", "z"]).await.unwrap();
    assert_eq!(found.len(), 2);
    assert_eq!(found["y"], "2");

    assert!(!cache.msetnx(&[("x", "9"), ("w", "9")]).await.unwrap());
    assert!(cache.msetnx(&[("v", "1"), ("w", "2")]).await.unwrap());
    assert_eq!(cache.delete_many(&["x", "y", "z"]).await.unwrap(), 2);
}

#[tokio::test]
async fn test_incr_and_decr() {
    let (cache, _) = memory_cache(config());

    assert!(matches!(cache.incr("hits", 1).await, Err(CacheError::KeyNotFound(_))));
    assert_eq!(cache.incr_unchecked("hits", 1).await.unwrap(), 1);
    assert_eq!(cache.incr("hits", 10).await.unwrap(), 11);
    assert_eq!(cache.decr("hits", 2).await.unwrap(), 9);
    assert_eq!(cache.get::<i64>("hits").await.unwrap(), Some(9));
}

#[tokio::test(start_paused = true)]
async fn test_incr_version_keeps_ttl() {
    let (cache, _) = memory_cache(config());
    cache.set("v", &5i64, Timeout::seconds(100)).await.unwrap();

    assert_eq!(cache.incr_version("v", 1, None).await.unwrap(), 2);
    assert_eq!(cache.get::<i64>("v").await.unwrap(), None);

    let v2 = cache.versioned(2);
    assert_eq!(v2.get::<i64>("v").await.unwrap(), Some(5));
    assert_eq!(v2.ttl("v").await.unwrap(), Some(100));

    assert!(matches!(
        cache.incr_version("missing", 1, None).await,
        Err(CacheError::KeyNotFound(_))
    ));
}

#[tokio::test]
async fn test_get_or_set_computes_once() {
    let (cache, _) = memory_cache(config());
    let calls = AtomicUsize::new(0);

    for _ in 0..3 {
        let value: String = cache
            .get_or_set("expensive", Timeout::Default, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok("computed".to_string())
            })
            .await
            .unwrap();
        assert_eq!(value, "computed");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_iter_keys_streams_every_match() {
    let (cache, _) = memory_cache(config());
    for i in 0..25 {
        cache.set(&format!("item:{i}"), &i, Timeout::Never).await.unwrap();
    }
    cache.set("other", "v", Timeout::Never).await.unwrap();

    use futures::TryStreamExt;
    let keys: Vec<String> = cache.iter_keys("item:*", Some(4)).try_collect().await.unwrap();
    assert_eq!(keys.len(), 25);
    assert!(keys.iter().all(|k| k.starts_with("item:")));
}

#[tokio::test]
async fn test_sets_and_hashes() {
    let (cache, _) = memory_cache(config());

    assert_eq!(cache.sadd("tags", &["a", "b", "a"]).await.unwrap(), 2);
    assert!(cache.sismember("tags", "a").await.unwrap());
    assert_eq!(cache.scard("tags").await.unwrap(), 2);
    let mut members: Vec<String> = cache.smembers("tags").await.unwrap();
    members.sort();
    assert_eq!(members, vec!["a", "b"]);
    assert_eq!(cache.srem("tags", &["a", "z"]).await.unwrap(), 1);

    assert!(cache.hset("user", "name", "ada").await.unwrap());
    assert!(!cache.hset("user", "name", "grace").await.unwrap());
    cache.hset("user", "age", &36i64).await.unwrap();
    assert_eq!(cache.hget::<String>("user", "name").await.unwrap().as_deref(), Some("grace"));
    assert_eq!(cache.hlen("user").await.unwrap(), 2);
    assert!(cache.hexists("user", "age").await.unwrap());
    let mut fields = cache.hkeys("user").await.unwrap();
    fields.sort();
    assert_eq!(fields, vec!["age", "name"]);
    assert_eq!(cache.hdel("user", &["age", "nope"]).await.unwrap(), 1);
}

#[tokio::test]
async fn test_lock_through_cache() {
    let (cache, _) = memory_cache(config());
    let options = LockOptions::default().timeout(Duration::from_secs(5)).non_blocking();
    let lock = cache.get_lock("report", options);
    assert_eq!(lock.name(), "test:1:report");

    let guard = lock.acquire().await.unwrap();
    assert!(matches!(
        cache.get_lock("report", options).acquire().await,
        Err(CacheError::LockTimeout(_))
    ));
    guard.release().await.unwrap();
    assert!(!lock.is_locked().await.unwrap());
}

#[tokio::test]
async fn test_sharded_routing() {
    let (cache, backends) = sharded_cache(3);
    let items: Vec<(String, i64)> = (0..30).map(|i| (format!("key{i}"), i)).collect();
    cache.set_many(&items, Timeout::Never).await.unwrap();

    assert!(backends.iter().all(|b| !b.is_empty()));
    assert_eq!(backends.iter().map(|b| b.len()).sum::<usize>(), 30);

    let keys: Vec<&str> = items.iter().map(|(k, _)| k.as_str()).collect();
    let found: std::collections::HashMap<String, i64> = cache.get_many(&keys).await.unwrap();
    assert_eq!(found.len(), 30);
    let merged: std::collections::HashMap<String, i64> = cache.mget_nonatomic(&keys).await.unwrap();
    assert_eq!(merged, found);

    assert_eq!(cache.keys("key*").await.unwrap().len(), 30);
    assert_eq!(cache.delete_pattern("key*", None).await.unwrap(), 30);
}

#[tokio::test]
async fn test_sharded_rejections() {
    let (cache, _) = sharded_cache(2);

    assert!(matches!(
        cache.mget::<_, String>(&["a", "b"]).await,
        Err(CacheError::Unsupported(_))
    ));
    assert!(matches!(cache.mset(&[("a", 1i64)]).await, Err(CacheError::Unsupported(_))));
    assert!(matches!(cache.get_client(true), Err(CacheError::Unsupported(_))));
    assert!(matches!(cache.raw_client(None), Err(CacheError::Config(_))));
    assert!(cache.raw_client(Some("a")).is_ok());
}

#[tokio::test]
async fn test_sharded_client_from_config() {
    let cache = Cache::new(
        CacheConfig::new("memory://s1,memory://s2").with_client(ClientKind::Sharded),
    )
    .unwrap();
    assert_eq!(cache.client().kind(), ClientKind::Sharded);
    cache.set("k", "v", Timeout::Never).await.unwrap();
    assert_eq!(cache.get::<String>("k").await.unwrap().as_deref(), Some("v"));
}

fn herd_cache(window: Duration) -> Cache {
    let nodes: Vec<Arc<dyn Backend>> = vec![Arc::new(MemoryBackend::named("herd"))];
    let client = Client::new(ClientKind::Herd, Replicated::new(nodes).unwrap()).with_herd(HerdPolicy::new(window));
    Cache::builder(config()).client(Arc::new(client)).build().unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_incr_version_keeps_herd_window() {
    let cache = herd_cache(Duration::from_secs(60));
    cache.set("page", "cached", Timeout::seconds(100)).await.unwrap();
    assert_eq!(cache.pttl("page").await.unwrap(), Some(160_000));

    for version in 2..=4 {
        assert_eq!(cache.incr_version("page", 1, Some(version - 1)).await.unwrap(), version);
    }
    let v4 = cache.versioned(4);
    assert_eq!(v4.pttl("page").await.unwrap(), Some(160_000));
    assert_eq!(v4.get::<String>("page").await.unwrap().as_deref(), Some("cached"));
}

#[tokio::test]
async fn test_incr_version_overflow_is_an_error() {
    let (cache, _) = memory_cache(config());
    cache.set("v", &1i64, Timeout::Never).await.unwrap();
    assert!(matches!(
        cache.incr_version("v", 1, Some(i64::MAX)).await,
        Err(CacheError::Command(_))
    ));
    assert_eq!(cache.get::<i64>("v").await.unwrap(), Some(1));
}

#[tokio::test]
async fn test_herd_serves_stale_value_inside_window() {
    let cache = herd_cache(Duration::from_secs(3600));
    cache.set("page", "cached", Timeout::millis(10)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(cache.get::<String>("page").await.unwrap().as_deref(), Some("cached"));
    assert!(matches!(cache.incr("page", 1).await, Err(CacheError::Unsupported(_))));
}

#[tokio::test]
async fn test_herd_reports_miss_after_window() {
    let cache = herd_cache(Duration::from_millis(20));
    cache.set("page", "cached", Timeout::millis(10)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    assert_eq!(cache.get::<String>("page").await.unwrap(), None);
}

#[tokio::test]
async fn test_sentinel_client_requires_sentinels() {
    let err = Cache::new(CacheConfig::new("valkey://mymaster/0").with_client(ClientKind::Sentinel)).unwrap_err();
    assert!(matches!(err, CacheError::Config(msg) if msg.contains("SENTINELS")));
}

#[tokio::test]
async fn test_sentinel_client_requires_sentinel_pool() {
    let mut config = CacheConfig::new("valkey://mymaster/0").with_client(ClientKind::Sentinel);
    config.options.connection.sentinels = vec![SentinelAddr::new("localhost", 26379)];

    let err = Cache::new(config).unwrap_err();
    assert!(matches!(err, CacheError::Config(msg) if msg.contains("CONNECTION_POOL_CLASS")));
}

#[tokio::test]
async fn test_sentinel_client_builds_lazily() {
    let mut config = CacheConfig::new("valkey://mymaster/0").with_client(ClientKind::Sentinel);
    config.options.connection = config
        .options
        .connection
        .with_sentinels(vec![SentinelAddr::new("localhost", 26379)]);

    let cache = Cache::new(config).unwrap();
    assert_eq!(cache.client().kind(), ClientKind::Sentinel);
    assert_eq!(cache.get_client(true).unwrap().describe(), "redis://mymaster:6379/0");
    assert!(cache.get_client(false).is_ok());
}

#[tokio::test]
async fn test_connection_errors_propagate_by_default() {
    assert!(!CacheOptions::default().ignore_exceptions);
    let (cache, backend) = memory_cache(config());
    backend.fail_after(0);
    assert!(cache.get::<String>("k").await.unwrap_err().is_connection_error());
}

#[tokio::test]
async fn test_ignore_exceptions_returns_defaults() {
    let (cache, backend) = memory_cache(config().ignore_exceptions(true));
    backend.fail_after(0);

    assert_eq!(cache.get::<String>("k").await.unwrap(), None);
    assert!(!cache.set("k", "v", Timeout::Never).await.unwrap());
    assert_eq!(cache.incr("k", 1).await.unwrap(), 0);
    assert!(cache.keys("*").await.unwrap().is_empty());
    assert_eq!(cache.ttl("k").await.unwrap(), None);
}

#[tokio::test]
async fn test_codec_errors_are_never_ignored() {
    let (cache, backend) = memory_cache(config().ignore_exceptions(true));
    backend
        .execute(Command::Set {
            key: cache.make_key("bad").as_str().to_string(),
            value: vec![0x7f, 0x01],
            expiry: None,
            condition: None,
        })
        .await
        .unwrap();
    assert!(matches!(cache.get::<String>("bad").await, Err(CacheError::Codec(_))));
}

#[tokio::test]
#[ignore = "requires Valkey"]
async fn test_live_round_trip() {
    let cache = Cache::new(CacheConfig::from_env().with_key_prefix("it")).unwrap();
    cache.set("live", "value", Timeout::seconds(30)).await.unwrap();
    assert_eq!(cache.get::<String>("live").await.unwrap().as_deref(), Some("value"));
    assert!(cache.delete("live").await.unwrap());
    cache.close();
}
