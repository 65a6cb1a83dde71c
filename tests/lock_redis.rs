//! Redis lock backend integration tests.
//!
//! Run with: cargo test --test lock_redis --features redis -- --ignored --nocapture
//!
//! Requires: REDIS_URI env var or Redis on localhost:6379
//!
//! Note: Tests use unique key prefixes to avoid data conflicts between runs.

use std::time::Duration;

use promulgate::entity::{Attribution, EntityKey, OperationKind};
use promulgate::lock::{LockBackend, LockMetadata, LockOutcome, RedisLockBackend};

fn redis_uri() -> String {
    std::env::var("REDIS_URI").unwrap_or_else(|_| "redis://localhost:6379".to_string())
}

fn test_prefix() -> String {
    format!(
        "test_{}",
        &uuid::Uuid::new_v4().simple().to_string()[..8]
    )
}

fn metadata(id: &str) -> LockMetadata {
    LockMetadata {
        kind: OperationKind::Update,
        attribution: Attribution::current_user(1),
        entity_type: "User".to_string(),
        entity_id: id.to_string(),
    }
}

async fn backend() -> RedisLockBackend {
    let prefix = test_prefix();
    println!("Using test prefix: {}", prefix);
    RedisLockBackend::connect(&redis_uri(), &prefix)
        .await
        .expect("Failed to connect to Redis")
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_redis_acquire_is_exclusive() {
    let backend = backend().await;
    let key = EntityKey::from("User:1");
    let ttl = Duration::from_secs(30);

    assert_eq!(
        backend.try_acquire(&key, "a", &metadata("1"), ttl).await.unwrap(),
        LockOutcome::Acquired
    );
    assert_eq!(
        backend.try_acquire(&key, "b", &metadata("1"), ttl).await.unwrap(),
        LockOutcome::Unavailable
    );

    assert!(!backend.release(&key, "b").await.unwrap());
    assert!(backend.release(&key, "a").await.unwrap());
    assert!(!backend.release(&key, "a").await.unwrap());

    assert_eq!(
        backend.try_acquire(&key, "b", &metadata("1"), ttl).await.unwrap(),
        LockOutcome::Acquired
    );
    assert!(backend.release(&key, "b").await.unwrap());
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_redis_expired_lock_is_recovered() {
    let backend = backend().await;
    let key = EntityKey::from("User:2");
    let stale = metadata("2");

    backend
        .try_acquire(&key, "crashed", &stale, Duration::from_millis(50))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let expired = backend.expired().await.unwrap();
    assert_eq!(expired, vec![(key.clone(), stale.clone())]);

    let outcome = backend
        .try_acquire(&key, "successor", &metadata("2"), Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(outcome, LockOutcome::Recovered(stale));

    // The crashed holder can no longer touch the lock
    assert!(!backend.extend(&key, "crashed", Duration::from_secs(30)).await.unwrap());
    assert!(!backend.release(&key, "crashed").await.unwrap());

    assert!(backend.extend(&key, "successor", Duration::from_secs(30)).await.unwrap());
    assert!(backend.expired().await.unwrap().is_empty());
    assert!(backend.release(&key, "successor").await.unwrap());
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_redis_relinquished_lock_is_recovered_with_handed_back_metadata() {
    let backend = backend().await;
    let key = EntityKey::from("User:3");
    let ttl = Duration::from_secs(30);
    let abandoned = LockMetadata {
        kind: OperationKind::Destroy,
        ..metadata("3")
    };

    backend.try_acquire(&key, "holder", &metadata("3"), ttl).await.unwrap();
    assert!(!backend.relinquish(&key, "intruder", &abandoned).await.unwrap());
    assert!(backend.relinquish(&key, "holder", &abandoned).await.unwrap());

    assert_eq!(backend.expired().await.unwrap(), vec![(key.clone(), abandoned.clone())]);
    assert_eq!(
        backend.try_acquire(&key, "next", &metadata("3"), ttl).await.unwrap(),
        LockOutcome::Recovered(abandoned)
    );
    assert!(backend.release(&key, "next").await.unwrap());
}
