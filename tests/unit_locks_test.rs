use olivinedb::core::locks::{DEFAULT_LOCK_TTL, LockManager, composite_holder};
use std::time::Duration;

#[tokio::test]
async fn test_fencing_tokens_are_monotonic() {
    let locks = LockManager::new();
    let g1 = locks.acquire("l", "n1:1", "r1", DEFAULT_LOCK_TTL).unwrap();
    locks.release("l", "n1:1");
    let g2 = locks.acquire("l", "n1:2", "r2", DEFAULT_LOCK_TTL).unwrap();
    assert!(g2.fencing_token > g1.fencing_token);
}

#[tokio::test]
async fn test_waiter_is_promoted_on_release() {
    let locks = LockManager::new();
    locks.acquire("l", "n1:1", "r1", DEFAULT_LOCK_TTL).unwrap();
    assert!(locks.acquire("l", "n1:2", "r2", DEFAULT_LOCK_TTL).is_none());
    let grant = locks.release("l", "n1:1").unwrap();
    assert_eq!(grant.holder, "n1:2");
    assert_eq!(grant.request_id, "r2");
}

#[tokio::test]
async fn test_disconnect_releases_everything_held() {
    let locks = LockManager::new();
    locks.acquire("a", "n1:1", "r1", DEFAULT_LOCK_TTL).unwrap();
    locks.acquire("b", "n1:1", "r2", DEFAULT_LOCK_TTL).unwrap();
    assert!(locks.acquire("a", "n2:9", "r3", DEFAULT_LOCK_TTL).is_none());
    let grants = locks.release_all_for("n1:1");
    assert_eq!(grants.len(), 1);
    assert_eq!(grants[0].holder, "n2:9");
    assert!(locks.holder("b").is_none());
}

#[tokio::test]
async fn test_expired_grant_is_reacquirable() {
    let locks = LockManager::new();
    locks
        .acquire("l", "n1:1", "r1", Duration::from_millis(0))
        .unwrap();
    assert!(locks.acquire("l", "n1:2", "r2", DEFAULT_LOCK_TTL).is_some());
}

#[tokio::test]
async fn test_reentrant_acquire_refreshes_the_grant() {
    let locks = LockManager::new();
    let g1 = locks.acquire("l", "n1:1", "r1", DEFAULT_LOCK_TTL).unwrap();
    let g2 = locks.acquire("l", "n1:1", "r2", DEFAULT_LOCK_TTL).unwrap();
    assert_eq!(g1.fencing_token, g2.fencing_token);
}

#[tokio::test]
async fn test_composite_holder_format() {
    assert_eq!(composite_holder("node-a", 42), "node-a:42");
}
