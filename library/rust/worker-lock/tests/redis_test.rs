//! 実 Redis に対する結合テスト。`REDIS_URL` を設定して `cargo test -- --ignored` で実行する。
#![cfg(feature = "redis")]

use std::time::Duration;

use worker_lock::{DistributedLockManager, LockManagerConfig, LockOptions, RunOutcome};

fn redis_config() -> LockManagerConfig {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    LockManagerConfig::default()
        .with_endpoint(url)
        .with_key_prefix(format!("worker-lock-test:{}", uuid::Uuid::new_v4().simple()))
        .with_default_retry_count(0)
}

#[tokio::test]
#[ignore = "requires a running Redis instance"]
async fn test_redis_acquire_release_extend() {
    let manager = DistributedLockManager::connect(redis_config()).await;
    assert!(manager.is_enabled());

    let options = LockOptions::new().with_ttl(Duration::from_millis(1000));
    let guard = manager.acquire("ticker", &options).await.unwrap();
    assert!(manager.acquire("ticker", &options).await.is_none());
    assert!(manager.exists("ticker").await);
    assert_eq!(manager.held_locks().await, vec!["ticker".to_string()]);

    assert!(!manager.extend("ticker", "other-token", Duration::from_secs(5)).await);
    assert!(manager.remaining_ttl("ticker").await.unwrap() <= Duration::from_millis(1000));
    assert!(manager.extend("ticker", &guard.token, Duration::from_secs(5)).await);
    assert!(manager.remaining_ttl("ticker").await.unwrap() > Duration::from_secs(4));

    assert!(!manager.release("ticker", "wrong-token").await);
    assert!(manager.release("ticker", &guard.token).await);
    assert!(!manager.exists("ticker").await);
}

#[tokio::test]
#[ignore = "requires a running Redis instance"]
async fn test_redis_lock_expires() {
    let manager = DistributedLockManager::connect(redis_config()).await;
    let options = LockOptions::new().with_ttl(Duration::from_millis(100));
    manager.acquire("candles:1m", &options).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(manager.acquire("candles:1m", &options).await.is_some());
}

#[tokio::test]
#[ignore = "requires a running Redis instance"]
async fn test_redis_run_exclusively() {
    let manager = DistributedLockManager::connect(redis_config()).await;
    let outcome = manager
        .run_exclusively("deposits", &LockOptions::new(), || async { Ok::<_, String>(5) })
        .await
        .unwrap();
    assert_eq!(outcome, RunOutcome::Executed(5));
    assert!(!manager.exists("deposits").await);
}

#[tokio::test]
async fn test_connect_without_endpoint_falls_back_to_disabled() {
    let manager = DistributedLockManager::connect(LockManagerConfig::default()).await;
    assert!(!manager.is_enabled());
    assert!(manager.acquire("ticker", &LockOptions::new()).await.is_some());
}

#[tokio::test]
async fn test_connect_with_invalid_endpoint_falls_back_to_disabled() {
    let config = LockManagerConfig::default().with_endpoint("not-a-redis-url");
    let manager = DistributedLockManager::connect(config).await;
    assert!(!manager.is_enabled());
}
