use olivinedb::core::crdt::Timestamp;
use olivinedb::core::protocol::{DeltaKind, ServerMessage};
use olivinedb::core::query::{Predicate, Query, QueryRegistry};
use serde_json::json;

fn ts() -> Timestamp {
    Timestamp::new(1, 0, "n1")
}

fn registry_with_subscription(filter: Option<Predicate>) -> QueryRegistry {
    let registry = QueryRegistry::new();
    registry.register(
        "q1".into(),
        7,
        "tasks".into(),
        Query {
            filter,
            ..Default::default()
        },
        Vec::new(),
    );
    registry
}

#[tokio::test]
async fn test_add_update_remove_lifecycle() {
    let registry = registry_with_subscription(Some(Predicate::Eq {
        field: "state".into(),
        value: json!("open"),
    }));

    let deltas = registry.process_change("tasks", "t1", Some(&json!({"state": "open"})), &ts());
    assert!(matches!(
        deltas[0].1,
        ServerMessage::QueryDelta {
            delta: DeltaKind::Added,
            ..
        }
    ));

    let deltas = registry.process_change(
        "tasks",
        "t1",
        Some(&json!({"state": "open", "x": 1})),
        &ts(),
    );
    assert!(matches!(
        deltas[0].1,
        ServerMessage::QueryDelta {
            delta: DeltaKind::Updated,
            ..
        }
    ));

    let deltas = registry.process_change("tasks", "t1", Some(&json!({"state": "done"})), &ts());
    assert!(matches!(
        deltas[0].1,
        ServerMessage::QueryDelta {
            delta: DeltaKind::Removed,
            ..
        }
    ));

    // Now outside the result set: a non-matching change is silent.
    let deltas = registry.process_change("tasks", "t1", Some(&json!({"state": "done"})), &ts());
    assert!(deltas.is_empty());
}

#[tokio::test]
async fn test_removed_key_emits_removed_delta() {
    let registry = registry_with_subscription(None);
    registry.process_change("tasks", "t1", Some(&json!({"a": 1})), &ts());
    let deltas = registry.process_change("tasks", "t1", None, &ts());
    assert!(matches!(
        deltas[0].1,
        ServerMessage::QueryDelta {
            delta: DeltaKind::Removed,
            ..
        }
    ));
}

#[tokio::test]
async fn test_session_close_drops_subscriptions() {
    let registry = registry_with_subscription(None);
    assert_eq!(registry.unregister_session(7), 1);
    assert!(registry.sessions_subscribed_to("tasks").is_empty());
}

#[tokio::test]
async fn test_changes_on_other_maps_are_ignored() {
    let registry = registry_with_subscription(None);
    let deltas = registry.process_change("users", "u1", Some(&json!({})), &ts());
    assert!(deltas.is_empty());
}
