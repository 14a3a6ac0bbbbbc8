// src/core/query/cursor.rs

//! Opaque, predicate-bound pagination tokens.
//!
//! A cursor encodes the last-seen key and sort values plus a fingerprint of
//! the sort spec and a hash of the predicate, so a token can only be replayed
//! against the query that issued it.

use super::{Query, QueryRow, SortSpec, cmp_values, sort_values};
use crate::core::crdt::wall_clock_ms;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;

/// Outcome of cursor validation, reported inline in `QUERY_RESP`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CursorStatus {
    Valid,
    Expired,
    Invalid,
    None,
}

/// The decoded cursor payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    pub last_key: String,
    /// Per-sort-field values of the last returned row, in sort-spec order.
    pub last_sort_value: Value,
    pub fingerprint: String,
    pub predicate_hash: String,
    pub issued_at_ms: i64,
}

/// Canonical fingerprint of a sort spec: `field:asc|desc` joined by commas.
pub fn sort_fingerprint(sort: &[SortSpec]) -> String {
    sort.iter()
        .map(|s| {
            format!(
                "{}:{}",
                s.field,
                if s.descending { "desc" } else { "asc" }
            )
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Hash of the predicate tree. Struct field order is fixed by serde, so the
/// JSON rendering is canonical.
pub fn predicate_hash(query: &Query) -> String {
    let rendered = serde_json::to_vec(&query.filter).unwrap_or_default();
    hex::encode(Sha256::digest(rendered))
}

impl Cursor {
    /// Builds a cursor pointing just past `row`.
    pub fn after(row: &QueryRow, query: &Query) -> Self {
        Self {
            last_key: row.key.clone(),
            last_sort_value: sort_values(&row.value, &query.sort),
            fingerprint: sort_fingerprint(&query.sort),
            predicate_hash: predicate_hash(query),
            issued_at_ms: wall_clock_ms(),
        }
    }

    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(self).expect("cursor serializes");
        URL_SAFE_NO_PAD.encode(json)
    }

    pub fn decode(token: &str) -> Option<Self> {
        let bytes = URL_SAFE_NO_PAD.decode(token).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// Validates this cursor against the query it is being replayed on.
    pub fn status_for(&self, query: &Query, max_age_ms: i64) -> CursorStatus {
        if self.fingerprint != sort_fingerprint(&query.sort)
            || self.predicate_hash != predicate_hash(query)
        {
            return CursorStatus::Invalid;
        }
        if wall_clock_ms().saturating_sub(self.issued_at_ms) > max_age_ms {
            return CursorStatus::Expired;
        }
        CursorStatus::Valid
    }

    /// True if `row` sorts strictly after this cursor's position.
    pub fn row_is_after(&self, row: &QueryRow, sort: &[SortSpec]) -> bool {
        let row_sort = sort_values(&row.value, sort);
        let row_values = row_sort.as_array().expect("sort_values returns an array");
        let cursor_values = match self.last_sort_value.as_array() {
            Some(values) => values,
            None => return true,
        };
        for ((row_value, cursor_value), spec) in
            row_values.iter().zip(cursor_values.iter()).zip(sort.iter())
        {
            let mut ord = cmp_values(row_value, cursor_value);
            if spec.descending {
                ord = ord.reverse();
            }
            match ord {
                Ordering::Greater => return true,
                Ordering::Less => return false,
                Ordering::Equal => {}
            }
        }
        row.key > self.last_key
    }
}

/// Applies cursor pagination to globally sorted rows: drops everything at or
/// before the cursor, takes `limit`, and issues a fresh cursor when more
/// rows remain.
pub fn paginate(
    mut rows: Vec<QueryRow>,
    query: &Query,
    cursor: Option<&Cursor>,
) -> (Vec<QueryRow>, Option<String>, bool) {
    if let Some(cursor) = cursor {
        rows.retain(|row| cursor.row_is_after(row, &query.sort));
    }
    let limit = query.limit.unwrap_or(usize::MAX);
    let has_more = rows.len() > limit;
    rows.truncate(limit);
    let next_cursor = if has_more {
        rows.last().map(|row| Cursor::after(row, query).encode())
    } else {
        None
    };
    (rows, next_cursor, has_more)
}

