use olivinedb::core::crdt::Timestamp;
use olivinedb::core::journal::JournalManager;
use olivinedb::core::protocol::EventType;

fn ts(millis: i64) -> Timestamp {
    Timestamp::new(millis, 0, "n1")
}

#[tokio::test]
async fn test_ring_evicts_oldest() {
    let journal = JournalManager::new(true, 3);
    for i in 0..5 {
        journal.append("m", &format!("k{i}"), EventType::Put, ts(i));
    }
    let (entries, has_more) = journal.read(0, 10);
    assert!(!has_more);
    let seqs: Vec<u64> = entries.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, [3, 4, 5]);
}

#[tokio::test]
async fn test_read_pages_with_has_more() {
    let journal = JournalManager::new(true, 10);
    for i in 0..5 {
        journal.append("m", &format!("k{i}"), EventType::Put, ts(i));
    }
    let (entries, has_more) = journal.read(2, 2);
    assert!(has_more);
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].seq, 2);
}

#[tokio::test]
async fn test_disabled_journal_appends_nothing() {
    let journal = JournalManager::new(false, 10);
    assert!(journal.append("m", "k", EventType::Put, ts(1)).is_none());
    assert!(journal.read(0, 10).0.is_empty());
}
