use olivinedb::core::handler::regulator::PipelineRegulator;
use olivinedb::core::handler::write_concern::WriteConcernTracker;
use olivinedb::core::protocol::WriteConcern;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_resolves_at_target_level() {
    let tracker = Arc::new(WriteConcernTracker::new());
    let rx = tracker.register("op1", WriteConcern::Replicated, Duration::from_secs(5));
    tracker.notify("op1", WriteConcern::Applied);
    tracker.notify("op1", WriteConcern::Replicated);
    let result = rx.await.unwrap();
    assert!(result.success);
    assert_eq!(result.achieved_level, WriteConcern::Replicated);
    assert_eq!(tracker.pending_count(), 0);
}

#[tokio::test]
async fn test_failure_reports_achieved_level() {
    let tracker = Arc::new(WriteConcernTracker::new());
    let rx = tracker.register("op1", WriteConcern::Persisted, Duration::from_secs(5));
    tracker.notify("op1", WriteConcern::Applied);
    tracker.fail("op1", "storage unavailable");
    let result = rx.await.unwrap();
    assert!(!result.success);
    assert_eq!(result.achieved_level, WriteConcern::Applied);
    assert_eq!(result.error.as_deref(), Some("storage unavailable"));
}

#[tokio::test]
async fn test_deadline_fires_for_unreached_targets() {
    let tracker = Arc::new(WriteConcernTracker::new());
    let rx = tracker.register("op1", WriteConcern::Persisted, Duration::from_millis(10));
    tracker.notify("op1", WriteConcern::Applied);
    let result = rx.await.unwrap();
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("Write concern timeout"));
}

#[tokio::test]
async fn test_late_lower_level_never_regresses() {
    let tracker = Arc::new(WriteConcernTracker::new());
    let rx = tracker.register("op1", WriteConcern::Persisted, Duration::from_secs(5));
    tracker.notify("op1", WriteConcern::Replicated);
    tracker.notify("op1", WriteConcern::Applied);
    tracker.fail("op1", "boom");
    let result = rx.await.unwrap();
    assert_eq!(result.achieved_level, WriteConcern::Replicated);
}

#[tokio::test]
async fn test_level_ladder_is_ordered() {
    assert!(WriteConcern::Memory < WriteConcern::Applied);
    assert!(WriteConcern::Applied < WriteConcern::Replicated);
    assert!(WriteConcern::Replicated < WriteConcern::Persisted);
    assert!(WriteConcern::FireAndForget.is_early_ack());
    assert!(WriteConcern::Memory.is_early_ack());
    assert!(!WriteConcern::Applied.is_early_ack());
}

#[tokio::test]
async fn test_regulator_saturation_refuses_then_recovers() {
    let regulator = PipelineRegulator::new(2, 1);
    assert!(regulator.register_pending());
    assert!(regulator.register_pending());
    assert!(!regulator.register_pending());
    assert!(regulator.should_force_sync());
    regulator.complete();
    assert!(regulator.register_pending());
}

#[tokio::test]
async fn test_regulator_wait_times_out_when_full() {
    let regulator = PipelineRegulator::new(1, 1);
    assert!(regulator.register_pending());
    assert!(!regulator.wait_for_capacity(Duration::from_millis(20)).await);
}

#[tokio::test]
async fn test_regulator_wait_wakes_on_completion() {
    let regulator = Arc::new(PipelineRegulator::new(1, 1));
    assert!(regulator.register_pending());
    let waiter = regulator.clone();
    let handle = tokio::spawn(async move { waiter.wait_for_capacity(Duration::from_secs(5)).await });
    tokio::time::sleep(Duration::from_millis(10)).await;
    regulator.complete();
    assert!(handle.await.unwrap());
}
