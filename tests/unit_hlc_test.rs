use olivinedb::core::crdt::{HlcClock, Timestamp, wall_clock_ms};

#[tokio::test]
async fn test_tick_is_strictly_monotonic() {
    let clock = HlcClock::new("n1");
    let mut last = clock.tick();
    for _ in 0..1000 {
        let next = clock.tick();
        assert!(next > last);
        last = next;
    }
}

#[tokio::test]
async fn test_update_advances_past_remote() {
    let clock = HlcClock::new("n1");
    let remote = Timestamp::new(wall_clock_ms() + 60_000, 7, "n2");
    clock.update(&remote);
    let local = clock.tick();
    assert!(local > remote);
}

#[tokio::test]
async fn test_ordering_is_total() {
    let a = Timestamp::new(5, 0, "n1");
    let b = Timestamp::new(5, 0, "n2");
    let c = Timestamp::new(5, 1, "n1");
    assert!(a < b);
    assert!(b < c);
    assert_eq!(a, Timestamp::new(5, 0, "n1"));
}
