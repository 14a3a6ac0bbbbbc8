use olivinedb::core::crdt::{CrdtMap, LwwMap, LwwRecord, Timestamp};
use olivinedb::core::query::cursor::paginate;
use olivinedb::core::query::{
    Cursor, CursorStatus, Predicate, Query, QueryRow, SortSpec, execute_local, sort_rows,
};
use serde_json::{Value, json};

fn ts(millis: i64) -> Timestamp {
    Timestamp::new(millis, 0, "n1")
}

fn lww_with(records: &[(&str, Value, i64)]) -> CrdtMap {
    let map = LwwMap::new();
    for (key, value, millis) in records {
        map.merge(key, LwwRecord::new(value.clone(), ts(*millis)));
    }
    CrdtMap::Lww(map)
}

fn row(key: &str, n: i64) -> QueryRow {
    QueryRow {
        key: key.to_string(),
        value: json!({ "n": n }),
        timestamp: ts(n),
    }
}

fn query_with_limit(limit: usize) -> Query {
    Query {
        sort: vec![SortSpec {
            field: "n".into(),
            descending: false,
        }],
        limit: Some(limit),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_tombstones_never_match() {
    let map = lww_with(&[("a", json!({"x": 1}), 10), ("b", Value::Null, 20)]);
    let rows = execute_local(&map, &Query::default());
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].key, "a");
}

#[tokio::test]
async fn test_predicate_and_sort() {
    let map = lww_with(&[
        ("a", json!({"n": 3}), 1),
        ("b", json!({"n": 1}), 2),
        ("c", json!({"n": 2}), 3),
        ("d", json!({"m": 9}), 4),
    ]);
    let query = Query {
        filter: Some(Predicate::Exists { field: "n".into() }),
        sort: vec![SortSpec {
            field: "n".into(),
            descending: false,
        }],
        ..Default::default()
    };
    let mut rows = execute_local(&map, &query);
    sort_rows(&mut rows, &query.sort);
    let keys: Vec<_> = rows.iter().map(|r| r.key.as_str()).collect();
    assert_eq!(keys, ["b", "c", "a"]);
}

#[tokio::test]
async fn test_single_key_takes_indexed_path() {
    let map = lww_with(&[("a", json!(1), 1), ("b", json!(2), 2)]);
    let query = Query {
        filter: Some(Predicate::Key { value: "b".into() }),
        ..Default::default()
    };
    let rows = execute_local(&map, &query);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].key, "b");
    assert_eq!(query.single_key().as_deref(), Some("b"));
}

#[tokio::test]
async fn test_cursor_walk_reconstructs_the_full_set() {
    let query = query_with_limit(2);
    let mut all = vec![row("a", 5), row("b", 1), row("c", 4), row("d", 2), row("e", 3)];
    sort_rows(&mut all, &query.sort);

    let mut collected = Vec::new();
    let mut cursor: Option<Cursor> = None;
    loop {
        let (page, next, has_more) = paginate(all.clone(), &query, cursor.as_ref());
        collected.extend(page.iter().map(|r| r.key.clone()));
        if !has_more {
            break;
        }
        cursor = Cursor::decode(&next.expect("cursor issued when has_more"));
        assert!(cursor.is_some());
    }
    assert_eq!(collected, ["b", "d", "e", "c", "a"]);
}

#[tokio::test]
async fn test_mismatched_predicate_invalidates_cursor() {
    let query = query_with_limit(2);
    let cursor = Cursor::after(&row("a", 1), &query);
    let mut other = query.clone();
    other.filter = Some(Predicate::Exists { field: "n".into() });
    assert_eq!(cursor.status_for(&other, 60_000), CursorStatus::Invalid);
    assert_eq!(cursor.status_for(&query, 60_000), CursorStatus::Valid);
}

#[tokio::test]
async fn test_stale_cursor_expires() {
    let query = query_with_limit(2);
    let mut cursor = Cursor::after(&row("a", 1), &query);
    cursor.issued_at_ms -= 120_000;
    assert_eq!(cursor.status_for(&query, 60_000), CursorStatus::Expired);
}

#[tokio::test]
async fn test_descending_sort_with_cursor() {
    let query = Query {
        sort: vec![SortSpec {
            field: "n".into(),
            descending: true,
        }],
        limit: Some(2),
        ..Default::default()
    };
    let mut all = vec![row("a", 1), row("b", 2), row("c", 3)];
    sort_rows(&mut all, &query.sort);
    let (page, next, has_more) = paginate(all.clone(), &query, None);
    assert_eq!(page[0].key, "c");
    assert!(has_more);
    let cursor = Cursor::decode(&next.unwrap()).unwrap();
    let (page, _, has_more) = paginate(all, &query, Some(&cursor));
    assert_eq!(page[0].key, "a");
    assert!(!has_more);
}
