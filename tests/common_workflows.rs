//! End-to-end workflows through the facade crate.

use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use valkey_cache::prelude::*;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Session {
    user: String,
    roles: Vec<String>,
    visits: u32,
}

fn session() -> Session {
    Session {
        user: "ada".into(),
        roles: vec!["admin".into(), "editor".into()],
        visits: 3,
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[tokio::test]
async fn test_settings_mapping_to_working_cache() {
    init_tracing();
    let config: CacheConfig = serde_json::from_str(
        r#"{
            "LOCATION": "memory://sessions",
            "TIMEOUT": 600,
            "KEY_PREFIX": "web",
            "VERSION": 3,
            "OPTIONS": {
                "SERIALIZER": "msgpack",
                "COMPRESSOR": "zlib",
                "COMPRESS_MIN_LENGTH": 8,
                "PICKLE_VERSION": -1
            }
        }"#,
    )
    .unwrap();
    let cache = Cache::new(config).unwrap();

    cache.set("session:42", &session(), Timeout::Default).await.unwrap();
    assert_eq!(cache.get::<Session>("session:42").await.unwrap(), Some(session()));
    assert_eq!(cache.make_key("session:42").as_str(), "web:3:session:42");
    assert_eq!(cache.keys("session:*").await.unwrap(), vec!["session:42"]);

    let ttl = cache.ttl("session:42").await.unwrap().unwrap();
    assert!(ttl > 590 && ttl <= 600);
}

#[tokio::test]
async fn test_counter_workflow() {
    let cache = Cache::new(CacheConfig::new("memory://counters")).unwrap();

    cache.set("visits", &0i64, Timeout::Never).await.unwrap();
    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move { cache.incr("visits", 1).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    assert_eq!(cache.get::<i64>("visits").await.unwrap(), Some(10));
}

#[tokio::test]
async fn test_lock_serializes_critical_section() {
    let cache = Cache::new(CacheConfig::new("memory://locks")).unwrap();
    cache.set("balance", &100i64, Timeout::Never).await.unwrap();

    let options = LockOptions::default()
        .timeout(Duration::from_secs(5))
        .sleep(Duration::from_millis(5))
        .blocking_timeout(Duration::from_secs(5));
    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let cache = cache.clone();
            tokio::spawn(async move {
                let lock = cache.get_lock("balance:lock", options);
                lock.with_lock(|| async {
                    let balance: i64 = cache.get("balance").await?.unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    cache.set("balance", &(balance - 10), Timeout::Never).await?;
                    Ok(())
                })
                .await
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }
    assert_eq!(cache.get::<i64>("balance").await.unwrap(), Some(60));
}

#[tokio::test]
async fn test_sharded_location_list() {
    let config: CacheConfig = serde_json::from_str(
        r#"{
            "LOCATION": ["memory://a", "memory://b", "memory://c"],
            "OPTIONS": {"CLIENT_CLASS": "django_valkey.client.ShardClient"}
        }"#,
    )
    .unwrap();
    let cache = Cache::new(config).unwrap();
    assert_eq!(cache.client().kind(), ClientKind::Sharded);

    let items: Vec<(String, String)> = (0..12).map(|i| (format!("k{i}"), format!("v{i}"))).collect();
    cache.set_many(&items, Timeout::Never).await.unwrap();
    assert_eq!(cache.keys("k*").await.unwrap().len(), 12);

    let mut streamed: Vec<String> = cache.iter_keys("k*", Some(5)).try_collect().await.unwrap();
    streamed.sort();
    let mut expected: Vec<String> = items.iter().map(|(k, _)| k.clone()).collect();
    expected.sort();
    assert_eq!(streamed, expected);

    assert!(cache.clear().await.unwrap());
    assert!(cache.keys("*").await.unwrap().is_empty());
}

#[test]
fn test_blocking_workflow() {
    let cache = BlockingCache::new(CacheConfig::new("memory://sync").with_key_prefix("cli")).unwrap();

    let value = cache
        .get_or_set("report", Timeout::seconds(60), || Ok(session()))
        .unwrap();
    assert_eq!(value, session());
    assert!(cache.has_key("report").unwrap());
    assert!(cache.touch("report", Timeout::Never).unwrap());
    assert_eq!(cache.ttl("report").unwrap(), None);

    cache.close();
}

#[test]
fn test_cache_on_caller_runtime() {
    tokio_test::block_on(async {
        let cache = Cache::new(CacheConfig::new("memory://caller")).unwrap();
        tokio_test::assert_ok!(cache.set("k", "v", Timeout::Never).await);
        assert_eq!(tokio_test::assert_ok!(cache.delete_many(&["k", "gone"]).await), 1);
    });
}

#[tokio::test]
#[ignore = "requires Valkey"]
async fn test_live_server_workflow() {
    let cache = Cache::new(CacheConfig::from_env().with_key_prefix("workflow")).unwrap();
    cache.set("session", &session(), Timeout::seconds(30)).await.unwrap();
    assert_eq!(cache.get::<Session>("session").await.unwrap(), Some(session()));
    assert_eq!(cache.delete_pattern("*", None).await.unwrap(), 1);
}
