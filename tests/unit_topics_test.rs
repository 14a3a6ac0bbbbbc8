use olivinedb::core::topics::TopicManager;

#[tokio::test]
async fn test_unsubscribe_all_clears_every_topic() {
    let topics = TopicManager::new();
    topics.subscribe("a", 1);
    topics.subscribe("b", 1);
    topics.subscribe("a", 2);
    topics.unsubscribe_all(1);
    assert_eq!(topics.local_subscribers("a"), vec![2]);
    assert!(topics.local_subscribers("b").is_empty());
}

#[tokio::test]
async fn test_subscribe_is_idempotent() {
    let topics = TopicManager::new();
    topics.subscribe("a", 1);
    topics.subscribe("a", 1);
    assert_eq!(topics.local_subscribers("a"), vec![1]);
}
