use olivinedb::core::search::{MemorySearchIndex, SearchIndex, SearchSubscription, SearchSubscriptions};
use serde_json::json;

#[tokio::test]
async fn test_index_and_search_round_trip() {
    let index = MemorySearchIndex::new();
    index.index_record("docs", "d1", Some(&json!({"title": "Rust coordination server"})));
    index.index_record("docs", "d2", Some(&json!({"title": "Coordination notes"})));
    assert_eq!(index.search("docs", "coordination", 10).len(), 2);
    assert_eq!(index.search("docs", "rust coordination", 10), vec!["d1"]);
    assert!(index.search("docs", "missing", 10).is_empty());
}

#[tokio::test]
async fn test_reindex_retracts_stale_postings() {
    let index = MemorySearchIndex::new();
    index.index_record("docs", "d1", Some(&json!("alpha")));
    index.index_record("docs", "d1", Some(&json!("beta")));
    assert!(index.search("docs", "alpha", 10).is_empty());
    assert_eq!(index.search("docs", "beta", 10), vec!["d1"]);
    index.index_record("docs", "d1", None);
    assert!(index.search("docs", "beta", 10).is_empty());
}

#[tokio::test]
async fn test_subscriptions_match_new_records() {
    let subs = SearchSubscriptions::new();
    subs.register(SearchSubscription {
        request_id: "r1".into(),
        session_id: 1,
        map: "docs".into(),
        text: "urgent task".into(),
    });
    let matching = subs.matching("docs", &json!({"title": "An urgent task appeared"}));
    assert_eq!(matching.len(), 1);
    assert!(subs.matching("docs", &json!({"title": "nothing"})).is_empty());
    assert!(subs.matching("other", &json!({"title": "urgent task"})).is_empty());

    subs.unregister_session(1);
    assert!(subs.matching("docs", &json!({"title": "urgent task"})).is_empty());
}
