use olivinedb::connection::{
    CoalescingWriter, ConnectionManager, ConnectionRateLimiter, WriterConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn test_writer() -> (
    Arc<CoalescingWriter>,
    mpsc::UnboundedSender<(u16, String)>,
) {
    let (tx, _rx) = mpsc::unbounded_channel();
    let (close_tx, _close_rx) = mpsc::unbounded_channel();
    (CoalescingWriter::new(tx, WriterConfig::balanced()), close_tx)
}

#[tokio::test]
async fn test_register_assigns_unique_ids() {
    let manager = ConnectionManager::new(Duration::from_secs(20));
    let (w1, c1) = test_writer();
    let (w2, c2) = test_writer();
    let a = manager.register(None, w1, c1);
    let b = manager.register(None, w2, c2);
    assert_ne!(a.id, b.id);
    assert_eq!(manager.count(), 2);
    assert!(manager.remove(a.id).is_some());
    assert!(manager.remove(a.id).is_none());
    assert_eq!(manager.count(), 1);
}

#[tokio::test]
async fn test_fresh_session_is_alive() {
    let manager = ConnectionManager::new(Duration::from_secs(20));
    let (writer, close) = test_writer();
    let session = manager.register(None, writer, close);
    assert!(manager.is_alive(session.id));
    assert!(manager.idle_time(session.id).unwrap() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_registration_callback_fires() {
    let manager = ConnectionManager::new(Duration::from_secs(20));
    let seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = seen.clone();
    manager.set_on_register(Box::new(move |_| {
        counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }));
    let (writer, close) = test_writer();
    manager.register(None, writer, close);
    assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_pending_cap_blocks_admission() {
    let limiter = ConnectionRateLimiter::new(100, 2);
    assert!(limiter.should_accept());
    limiter.on_attempt();
    limiter.on_attempt();
    assert!(!limiter.should_accept());
    limiter.on_failed();
    assert!(limiter.should_accept());
}

#[tokio::test]
async fn test_completed_window_blocks_admission() {
    let limiter = ConnectionRateLimiter::new(2, 10);
    for _ in 0..2 {
        limiter.on_attempt();
        limiter.on_established();
    }
    assert!(!limiter.should_accept());
}

#[tokio::test]
async fn test_rejection_counter_increments() {
    let limiter = ConnectionRateLimiter::new(1, 1);
    limiter.on_rejected();
    limiter.on_rejected();
    assert_eq!(limiter.rejected_total(), 2);
}
