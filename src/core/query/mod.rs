// src/core/query/mod.rs

//! Query AST, predicate evaluation, sorting, and local execution against the
//! CRDT maps. Scatter/gather across partition owners lives in the handler
//! layer; this module is purely computational.

pub mod cursor;
pub mod registry;

use crate::core::crdt::{CrdtMap, Timestamp};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

pub use cursor::{Cursor, CursorStatus};
pub use registry::QueryRegistry;

/// One result row: key, aggregated value, and the HLC of the newest
/// contributing record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRow {
    pub key: String,
    pub value: Value,
    pub timestamp: Timestamp,
}

/// Sort direction for one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortSpec {
    pub field: String,
    #[serde(default)]
    pub descending: bool,
}

/// The predicate tree. `Key` pins the query to an exact key, which unlocks
/// the indexed execution path and single-replica reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Predicate {
    Key { value: String },
    Eq { field: String, value: Value },
    Ne { field: String, value: Value },
    Gt { field: String, value: Value },
    Gte { field: String, value: Value },
    Lt { field: String, value: Value },
    Lte { field: String, value: Value },
    In { field: String, values: Vec<Value> },
    Contains { field: String, value: String },
    StartsWith { field: String, value: String },
    Exists { field: String },
    And { predicates: Vec<Predicate> },
    Or { predicates: Vec<Predicate> },
    Not { predicate: Box<Predicate> },
}

/// A declarative query over one map.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Query {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub filter: Option<Predicate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sort: Vec<SortSpec>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub limit: Option<usize>,
    /// Interested field set for incremental delivery; `None` means all.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub fields: Option<Vec<String>>,
}

impl Query {
    /// Returns the exact key when the filter pins one.
    pub fn single_key(&self) -> Option<String> {
        match &self.filter {
            Some(Predicate::Key { value }) => Some(value.clone()),
            Some(Predicate::And { predicates }) => predicates.iter().find_map(|p| match p {
                Predicate::Key { value } => Some(value.clone()),
                _ => None,
            }),
            _ => None,
        }
    }

    pub fn matches(&self, key: &str, value: &Value) -> bool {
        match &self.filter {
            Some(predicate) => eval_predicate(predicate, key, value),
            None => true,
        }
    }
}

/// Looks up a dotted path inside a JSON object.
pub fn field_value<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Total order over JSON values: Null < Bool < Number < String < Array <
/// Object. Numbers compare as floats; everything else structurally.
pub fn cmp_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = OrderedFloat(x.as_f64().unwrap_or(f64::NAN));
            let y = OrderedFloat(y.as_f64().unwrap_or(f64::NAN));
            x.cmp(&y)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (xi, yi) in x.iter().zip(y.iter()) {
                let ord = cmp_values(xi, yi);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            let mut x_keys: Vec<_> = x.keys().collect();
            let mut y_keys: Vec<_> = y.keys().collect();
            x_keys.sort();
            y_keys.sort();
            for (xk, yk) in x_keys.iter().zip(y_keys.iter()) {
                let ord = xk.cmp(yk).then_with(|| cmp_values(&x[*xk], &y[*yk]));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Evaluates a predicate against one record.
pub fn eval_predicate(predicate: &Predicate, key: &str, value: &Value) -> bool {
    match predicate {
        Predicate::Key { value: expected } => key == expected,
        Predicate::Eq { field, value: expected } => {
            field_value(value, field).is_some_and(|v| v == expected)
        }
        Predicate::Ne { field, value: expected } => {
            field_value(value, field).is_none_or(|v| v != expected)
        }
        Predicate::Gt { field, value: expected } => field_value(value, field)
            .is_some_and(|v| cmp_values(v, expected) == Ordering::Greater),
        Predicate::Gte { field, value: expected } => {
            field_value(value, field).is_some_and(|v| cmp_values(v, expected) != Ordering::Less)
        }
        Predicate::Lt { field, value: expected } => {
            field_value(value, field).is_some_and(|v| cmp_values(v, expected) == Ordering::Less)
        }
        Predicate::Lte { field, value: expected } => {
            field_value(value, field).is_some_and(|v| cmp_values(v, expected) != Ordering::Greater)
        }
        Predicate::In { field, values } => {
            field_value(value, field).is_some_and(|v| values.contains(v))
        }
        Predicate::Contains { field, value: needle } => field_value(value, field)
            .and_then(Value::as_str)
            .is_some_and(|s| s.contains(needle.as_str())),
        Predicate::StartsWith { field, value: prefix } => field_value(value, field)
            .and_then(Value::as_str)
            .is_some_and(|s| s.starts_with(prefix.as_str())),
        Predicate::Exists { field } => field_value(value, field).is_some(),
        Predicate::And { predicates } => {
            predicates.iter().all(|p| eval_predicate(p, key, value))
        }
        Predicate::Or { predicates } => predicates.iter().any(|p| eval_predicate(p, key, value)),
        Predicate::Not { predicate } => !eval_predicate(predicate, key, value),
    }
}

/// Sort key for one row under a sort spec: the per-field values, in order.
pub fn sort_values(row_value: &Value, sort: &[SortSpec]) -> Value {
    Value::Array(
        sort.iter()
            .map(|spec| field_value(row_value, &spec.field).cloned().unwrap_or(Value::Null))
            .collect(),
    )
}

/// Compares two rows under a sort spec; ties break on the key so the global
/// order is total, which cursor pagination depends on.
pub fn cmp_rows(a: &QueryRow, b: &QueryRow, sort: &[SortSpec]) -> Ordering {
    for spec in sort {
        let av = field_value(&a.value, &spec.field).unwrap_or(&Value::Null);
        let bv = field_value(&b.value, &spec.field).unwrap_or(&Value::Null);
        let mut ord = cmp_values(av, bv);
        if spec.descending {
            ord = ord.reverse();
        }
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.key.cmp(&b.key)
}

/// Globally sorts rows in place under the query's sort spec.
pub fn sort_rows(rows: &mut [QueryRow], sort: &[SortSpec]) {
    rows.sort_by(|a, b| cmp_rows(a, b, sort));
}

/// Collapses an OR key's surviving entries into one row value.
fn aggregate_or_values(values: Vec<Value>) -> Value {
    if values.len() == 1 {
        values.into_iter().next().expect("len checked")
    } else {
        Value::Array(values)
    }
}

/// Executes a query against a local map. An exact-key filter takes the
/// indexed path; everything else scans and applies the predicate per record.
/// LWW tombstones never match; OR keys aggregate their surviving values.
pub fn execute_local(map: &CrdtMap, query: &Query) -> Vec<QueryRow> {
    let mut rows = Vec::new();
    match map {
        CrdtMap::Lww(lww) => {
            if let Some(key) = query.single_key() {
                if let Some(record) = lww.get(&key)
                    && !record.is_tombstone()
                    && query.matches(&key, &record.value)
                {
                    rows.push(QueryRow {
                        key,
                        value: record.value,
                        timestamp: record.timestamp,
                    });
                }
                return rows;
            }
            lww.for_each(|key, record| {
                if !record.is_tombstone() && query.matches(key, &record.value) {
                    rows.push(QueryRow {
                        key: key.to_string(),
                        value: record.value.clone(),
                        timestamp: record.timestamp.clone(),
                    });
                }
            });
        }
        CrdtMap::Or(or) => {
            let mut push_key = |key: &str, entries: &[crate::core::crdt::TaggedEntry]| {
                if entries.is_empty() {
                    return;
                }
                let newest = entries
                    .iter()
                    .map(|e| &e.timestamp)
                    .max()
                    .cloned()
                    .expect("non-empty");
                let matches = entries.iter().any(|e| query.matches(key, &e.value));
                if matches {
                    rows.push(QueryRow {
                        key: key.to_string(),
                        value: aggregate_or_values(
                            entries.iter().map(|e| e.value.clone()).collect(),
                        ),
                        timestamp: newest,
                    });
                }
            };
            if let Some(key) = query.single_key() {
                let entries = or.get(&key);
                push_key(&key, &entries);
                return rows;
            }
            or.for_each(|key, entries| push_key(key, entries));
        }
    }
    rows
}

