use olivinedb::core::crdt::{LwwMap, LwwRecord, MerkleTree, OrMap, TaggedEntry, Timestamp};
use serde_json::{Value, json};

fn ts(millis: i64, counter: u32, node: &str) -> Timestamp {
    Timestamp::new(millis, counter, node)
}

fn entry(value: Value, tag: &str, millis: i64) -> TaggedEntry {
    TaggedEntry {
        value,
        timestamp: ts(millis, 0, "n1"),
        tag: tag.to_string(),
        ttl_ms: None,
    }
}

#[tokio::test]
async fn test_lww_greater_hlc_wins() {
    let map = LwwMap::new();
    map.merge("k", LwwRecord::new(json!("a"), ts(10, 0, "n1")));
    let outcome = map.merge("k", LwwRecord::new(json!("b"), ts(20, 0, "n2")));
    assert!(outcome.applied);
    assert_eq!(map.get("k").unwrap().value, json!("b"));

    let outcome = map.merge("k", LwwRecord::new(json!("stale"), ts(5, 0, "n3")));
    assert!(!outcome.applied);
    assert_eq!(map.get("k").unwrap().value, json!("b"));
}

#[tokio::test]
async fn test_lww_tombstone_prune_respects_safe_point() {
    let map = LwwMap::new();
    map.merge("old", LwwRecord::new(Value::Null, ts(10, 0, "n1")));
    map.merge("new", LwwRecord::new(Value::Null, ts(100, 0, "n1")));
    let pruned = map.prune_tombstones(&ts(50, 0, ""));
    assert_eq!(pruned, vec!["old".to_string()]);
    assert!(map.get("old").is_none());
    assert!(map.get("new").is_some());
}

#[tokio::test]
async fn test_ormap_add_then_remove_leaves_key_absent() {
    let map = OrMap::new();
    assert!(map.apply_add("k", entry(json!(1), "t1", 10)));
    assert!(map.contains_key("k"));
    map.apply_remove("k", "t1", ts(20, 0, "n1"));
    assert!(!map.contains_key("k"));
}

#[tokio::test]
async fn test_ormap_remove_before_add_suppresses_the_add() {
    let map = OrMap::new();
    map.apply_remove("k", "t1", ts(20, 0, "n1"));
    assert!(!map.apply_add("k", entry(json!(1), "t1", 10)));
    assert!(!map.contains_key("k"));
}

#[tokio::test]
async fn test_ormap_concurrent_adds_with_distinct_tags_both_survive() {
    let map = OrMap::new();
    map.apply_add("k", entry(json!("a"), "t1", 10));
    map.apply_add("k", entry(json!("b"), "t2", 10));
    assert_eq!(map.get("k").len(), 2);
}

#[tokio::test]
async fn test_merkle_same_contents_same_root() {
    let a = MerkleTree::new();
    let b = MerkleTree::new();
    a.update("k1", b"v1");
    a.update("k2", b"v2");
    b.update("k2", b"v2");
    b.update("k1", b"v1");
    assert_eq!(a.root(), b.root());
}

#[tokio::test]
async fn test_merkle_update_then_remove_restores_root() {
    let tree = MerkleTree::new();
    let empty_root = tree.root();
    tree.update("k1", b"v1");
    assert_ne!(tree.root(), empty_root);
    tree.remove("k1");
    assert_eq!(tree.root(), empty_root);
}
