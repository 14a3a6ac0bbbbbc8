// tests/property_test.rs

//! Property-style tests for the coordinator's core invariants: CRDT
//! convergence under reordering, batch envelope round-trips, Write-Concern
//! monotonicity, and cursor pagination stability.

use bytes::Bytes;
use olivinedb::core::crdt::{LwwMap, LwwRecord, OrMap, TaggedEntry, Timestamp};
use olivinedb::core::handler::write_concern::WriteConcernTracker;
use olivinedb::core::protocol::WriteConcern;
use olivinedb::core::protocol::codec::{decode_batch_envelope, encode_batch_envelope};
use olivinedb::core::query::cursor::paginate;
use olivinedb::core::query::{Cursor, Query, QueryRow, SortSpec, sort_rows};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn ts(millis: i64, counter: u32, node: &str) -> Timestamp {
    Timestamp::new(millis, counter, node)
}

/// Deterministic permutation generator (Heap's algorithm, bounded).
fn permutations<T: Clone>(items: &[T], cap: usize) -> Vec<Vec<T>> {
    fn heap<T: Clone>(k: usize, items: &mut Vec<T>, out: &mut Vec<Vec<T>>, cap: usize) {
        if out.len() >= cap {
            return;
        }
        if k <= 1 {
            out.push(items.clone());
            return;
        }
        for i in 0..k {
            heap(k - 1, items, out, cap);
            if k % 2 == 0 {
                items.swap(i, k - 1);
            } else {
                items.swap(0, k - 1);
            }
        }
    }
    let mut items = items.to_vec();
    let mut out = Vec::new();
    let len = items.len();
    heap(len, &mut items, &mut out, cap);
    out
}

#[tokio::test]
async fn test_lww_merge_converges_under_any_interleaving() {
    let ops = vec![
        ("k1", json!("a"), ts(10, 0, "n1")),
        ("k1", json!("b"), ts(10, 1, "n2")),
        ("k1", json!("c"), ts(9, 5, "n3")),
        ("k2", serde_json::Value::Null, ts(20, 0, "n1")),
        ("k2", json!(42), ts(19, 9, "n2")),
    ];

    // The reference outcome: replay in HLC order on one map.
    let reference = LwwMap::new();
    let mut sorted = ops.clone();
    sorted.sort_by(|a, b| a.2.cmp(&b.2));
    for (key, value, stamp) in &sorted {
        reference.merge(key, LwwRecord::new(value.clone(), stamp.clone()));
    }

    for permutation in permutations(&ops, 120) {
        let map = LwwMap::new();
        for (key, value, stamp) in &permutation {
            map.merge(key, LwwRecord::new(value.clone(), stamp.clone()));
        }
        // Idempotence: replaying the whole permutation changes nothing.
        for (key, value, stamp) in &permutation {
            map.merge(key, LwwRecord::new(value.clone(), stamp.clone()));
        }
        for key in ["k1", "k2"] {
            assert_eq!(
                map.get(key).map(|r| (r.value, r.timestamp)),
                reference.get(key).map(|r| (r.value, r.timestamp)),
                "divergence on {key:?}"
            );
        }
    }
}

#[tokio::test]
async fn test_ormap_converges_under_any_interleaving() {
    #[derive(Clone)]
    enum Op {
        Add(&'static str, &'static str, i64),
        Remove(&'static str, &'static str, i64),
    }
    let ops = vec![
        Op::Add("k", "t1", 10),
        Op::Add("k", "t2", 11),
        Op::Remove("k", "t1", 12),
        Op::Add("j", "t3", 13),
    ];

    let apply_all = |sequence: &[Op]| {
        let map = OrMap::new();
        for op in sequence {
            match op {
                Op::Add(key, tag, millis) => {
                    map.apply_add(
                        key,
                        TaggedEntry {
                            value: json!(tag),
                            timestamp: ts(*millis, 0, "n1"),
                            tag: tag.to_string(),
                            ttl_ms: None,
                        },
                    );
                }
                Op::Remove(key, tag, millis) => {
                    map.apply_remove(key, tag, ts(*millis, 0, "n1"));
                }
            }
        }
        map
    };

    for permutation in permutations(&ops, 24) {
        let map = apply_all(&permutation);
        let mut tags: Vec<String> = map.get("k").into_iter().map(|e| e.tag).collect();
        tags.sort();
        assert_eq!(tags, ["t2"], "observed-remove must win in every order");
        assert!(map.contains_key("j"));
    }
}

#[tokio::test]
async fn test_batch_envelope_round_trips_arbitrary_sequences() {
    let mut frames: Vec<Bytes> = Vec::new();
    for size in [0usize, 1, 7, 64, 1024] {
        frames.push(Bytes::from(vec![0xAB; size]));
        let (count, data) = encode_batch_envelope(&frames);
        assert_eq!(count as usize, frames.len());
        let decoded = decode_batch_envelope(&data).unwrap();
        assert_eq!(decoded, frames, "round trip failed at {} frames", frames.len());
    }
}

#[tokio::test]
async fn test_write_concern_terminal_states_are_well_formed() {
    let tracker = Arc::new(WriteConcernTracker::new());

    // Success path: terminal at exactly the target.
    let rx = tracker.register("ok", WriteConcern::Persisted, Duration::from_secs(5));
    for level in [
        WriteConcern::Applied,
        WriteConcern::Replicated,
        WriteConcern::Persisted,
    ] {
        tracker.notify("ok", level);
    }
    let result = rx.await.unwrap();
    assert!(result.success);
    assert_eq!(result.achieved_level, WriteConcern::Persisted);
    assert!(result.error.is_none());

    // Failure path: achieved below target, error attached.
    let rx = tracker.register("bad", WriteConcern::Persisted, Duration::from_secs(5));
    tracker.notify("bad", WriteConcern::Applied);
    tracker.fail("bad", "Rejected by conflict resolver");
    let result = rx.await.unwrap();
    assert!(!result.success);
    assert!(result.achieved_level < WriteConcern::Persisted);
    assert!(result.error.is_some());
}

#[tokio::test]
async fn test_cursor_pagination_has_no_duplicates_or_gaps() {
    let query = Query {
        sort: vec![SortSpec {
            field: "rank".into(),
            descending: false,
        }],
        limit: Some(3),
        ..Default::default()
    };
    // Duplicate sort values force the key tie-break to carry the order.
    let mut rows: Vec<QueryRow> = (0..20)
        .map(|i| QueryRow {
            key: format!("k{i:02}"),
            value: json!({ "rank": i % 5 }),
            timestamp: ts(i, 0, "n1"),
        })
        .collect();
    sort_rows(&mut rows, &query.sort);
    let expected: Vec<String> = rows.iter().map(|r| r.key.clone()).collect();

    let mut walked = Vec::new();
    let mut cursor: Option<Cursor> = None;
    loop {
        let (page, next, has_more) = paginate(rows.clone(), &query, cursor.as_ref());
        walked.extend(page.iter().map(|r| r.key.clone()));
        if !has_more {
            break;
        }
        cursor = Some(Cursor::decode(&next.unwrap()).unwrap());
    }
    assert_eq!(walked, expected);
}
