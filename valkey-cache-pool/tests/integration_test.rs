//! Integration tests for valkey-cache-pool.

use std::sync::Arc;
use std::time::Duration;
use valkey_cache_pool::*;

fn factory(options: ConnectionOptions) -> (Arc<PoolRegistry>, Arc<dyn ConnectionFactory>) {
    let registry = Arc::new(PoolRegistry::new());
    let factory = options
        .connection_factory
        .build(&options, registry.clone())
        .unwrap();
    (registry, factory)
}

#[tokio::test]
async fn test_options_from_json_build_a_direct_factory() {
    let options: ConnectionOptions = serde_json::from_str(
        r#"{
            "CONNECTION_POOL_KWARGS": {"max_connections": 3},
            "SOCKET_CONNECT_TIMEOUT": 0.25
        }"#,
    )
    .unwrap();
    let (registry, factory) = factory(options);

    let pool = factory.connect("unix:///var/run/valkey/valkey.sock?db=2").unwrap();
    assert_eq!(pool.max_connections(), 3);
    assert_eq!(pool.params().db(), 2);
    assert_eq!(factory.name(), "direct");
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn test_refused_connection_is_connection_error_and_not_retried() {
    let options = ConnectionOptions::default()
        .with_connect_timeout(Duration::from_millis(200))
        .with_pool(PoolConfig::default().checkout_timeout(Duration::from_millis(300)));
    let (_registry, factory) = factory(options);

    let params = factory.make_connection_params("redis://127.0.0.1:1").unwrap();
    let err = factory.get_connection(&params).await.err().unwrap();
    assert!(err.is_connection_error(), "{err:?}");
}

#[tokio::test]
async fn test_disconnect_then_reuse() {
    let (registry, factory) = factory(ConnectionOptions::default());
    let first = factory.connect("redis://localhost").unwrap();
    factory.disconnect();
    assert!(registry.is_empty());

    let second = factory.connect("redis://localhost").unwrap();
    assert!(!first.same_pool(&second));
}

#[tokio::test]
#[ignore = "requires Valkey"]
async fn test_pool_respects_max_connections() {
    let options = ConnectionOptions::default()
        .with_pool(PoolConfig::default().max_connections(2).checkout_timeout(Duration::from_millis(200)));
    let (_registry, factory) = factory(options);
    let pool = factory.connect("redis://127.0.0.1:6379").unwrap();

    let a = pool.get().await.unwrap();
    let b = pool.get().await.unwrap();
    assert!(matches!(pool.get().await, Err(PoolError::Timeout(_))));
    assert!(pool.state().connections <= 2);
    drop((a, b));
}
