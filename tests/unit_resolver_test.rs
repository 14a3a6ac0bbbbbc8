use olivinedb::core::crdt::{LwwRecord, Timestamp};
use olivinedb::core::protocol::ResolverStrategy;
use olivinedb::core::resolver::{Resolution, ResolverManager};
use serde_json::json;

fn record(value: serde_json::Value, millis: i64) -> LwwRecord {
    LwwRecord::new(value, Timestamp::new(millis, 0, "n1"))
}

#[tokio::test]
async fn test_max_value_keeps_the_greater_payload() {
    let resolvers = ResolverManager::new();
    resolvers.register("scores", ResolverStrategy::MaxValue);
    let existing = record(json!(10), 1);
    let incoming = record(json!(5), 2);
    assert_eq!(
        resolvers.resolve("scores", &existing, &incoming),
        Some(Resolution::KeepExisting)
    );
}

#[tokio::test]
async fn test_reject_older_rejects_stale_writes() {
    let resolvers = ResolverManager::new();
    resolvers.register("audit", ResolverStrategy::RejectOlder);
    let existing = record(json!("current"), 10);
    let incoming = record(json!("stale"), 5);
    assert_eq!(
        resolvers.resolve("audit", &existing, &incoming),
        Some(Resolution::Rejected)
    );
}

#[tokio::test]
async fn test_unregistered_map_has_no_resolver() {
    let resolvers = ResolverManager::new();
    assert!(resolvers.get("anything").is_none());
}

#[tokio::test]
async fn test_list_reflects_registrations() {
    let resolvers = ResolverManager::new();
    resolvers.register("a", ResolverStrategy::MinValue);
    resolvers.register("b", ResolverStrategy::LastWriterWins);
    assert_eq!(resolvers.list().len(), 2);
    assert!(resolvers.unregister("a"));
    assert!(!resolvers.unregister("a"));
    assert_eq!(resolvers.list().len(), 1);
}
