use olivinedb::core::counters::CounterManager;

#[tokio::test]
async fn test_deltas_from_distinct_nodes_sum() {
    let counters = CounterManager::new();
    assert_eq!(counters.apply_delta("hits", "n1", 3), 3);
    assert_eq!(counters.apply_delta("hits", "n2", 2), 5);
    assert_eq!(counters.apply_delta("hits", "n1", -1), 4);
    assert_eq!(counters.value("hits"), 4);
}

#[tokio::test]
async fn test_merge_slot_is_idempotent() {
    let counters = CounterManager::new();
    counters.apply_delta("hits", "n1", 3);
    assert_eq!(counters.merge_slot("hits", "n2", 7), 10);
    assert_eq!(counters.merge_slot("hits", "n2", 7), 10);
}

#[tokio::test]
async fn test_subscriber_cleanup_on_close() {
    let counters = CounterManager::new();
    counters.subscribe("hits", 1);
    counters.subscribe("hits", 2);
    counters.unsubscribe_all(1);
    assert_eq!(counters.subscribers("hits"), vec![2]);
}
