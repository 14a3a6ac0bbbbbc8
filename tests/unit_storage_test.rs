use olivinedb::core::OlivineError;
use olivinedb::core::crdt::{LwwRecord, MapType, Timestamp};
use olivinedb::core::storage::{MemoryStorage, StorageDriver, StorageManager, StoredRecord};
use serde_json::json;
use std::sync::Arc;

#[tokio::test]
async fn test_lazy_create_then_type_mismatch_fails() {
    let manager = StorageManager::new(Arc::new(MemoryStorage::new()));
    let map = manager.get_or_create("tasks", MapType::Lww).unwrap();
    map.await_ready().await;
    let err = manager.get_or_create("tasks", MapType::Or).unwrap_err();
    assert!(matches!(err, OlivineError::MapTypeMismatch { .. }));
}

#[tokio::test]
async fn test_hydrates_previously_persisted_records() {
    let driver = Arc::new(MemoryStorage::new());
    driver
        .store_record(
            "tasks",
            "t1",
            &StoredRecord::Lww(LwwRecord::new(
                json!({"title": "persisted"}),
                Timestamp::new(5, 0, "n1"),
            )),
        )
        .await
        .unwrap();

    let manager = StorageManager::new(driver);
    let map = manager.get_or_create("tasks", MapType::Lww).unwrap();
    map.await_ready().await;
    let record = map.map.as_lww().unwrap().get("t1").unwrap();
    assert_eq!(record.value, json!({"title": "persisted"}));
}

#[tokio::test]
async fn test_persist_key_round_trips_through_the_driver() {
    let driver = Arc::new(MemoryStorage::new());
    let manager = StorageManager::new(driver.clone());
    let map = manager.get_or_create("tasks", MapType::Lww).unwrap();
    map.await_ready().await;
    map.map
        .as_lww()
        .unwrap()
        .merge("t1", LwwRecord::new(json!(1), Timestamp::new(1, 0, "n1")));
    manager.persist_key(&map, "t1").await.unwrap();

    let stored = driver.load_map("tasks").await.unwrap();
    assert_eq!(stored.len(), 1);
    assert!(matches!(stored[0].1, StoredRecord::Lww(_)));
}

#[tokio::test]
async fn test_missing_map_is_not_created_by_get() {
    let manager = StorageManager::new(Arc::new(MemoryStorage::new()));
    assert!(manager.get("nope").is_none());
    assert!(manager.map_names().is_empty());
}
