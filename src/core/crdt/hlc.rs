// src/core/crdt/hlc.rs

//! Hybrid Logical Clock: a totally ordered, causally consistent timestamp
//! combining wall-clock millis, a logical counter, and the node id.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

/// An HLC timestamp. Ordering is `(millis, counter, node_id)`, which makes the
/// order total across the cluster: two distinct events never compare equal
/// unless they are the same event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timestamp {
    pub millis: i64,
    pub counter: u32,
    pub node_id: String,
}

impl Timestamp {
    pub fn new(millis: i64, counter: u32, node_id: impl Into<String>) -> Self {
        Self {
            millis,
            counter,
            node_id: node_id.into(),
        }
    }

    /// The zero timestamp, older than every real event.
    pub fn zero() -> Self {
        Self {
            millis: 0,
            counter: 0,
            node_id: String::new(),
        }
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.millis
            .cmp(&other.millis)
            .then_with(|| self.counter.cmp(&other.counter))
            .then_with(|| self.node_id.cmp(&other.node_id))
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.millis, self.counter, self.node_id)
    }
}

/// Returns the current wall-clock time in milliseconds since the UNIX epoch.
pub fn wall_clock_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[derive(Debug, Default)]
struct ClockState {
    last_millis: i64,
    counter: u32,
}

/// The node-local HLC clock. `tick` produces a fresh timestamp strictly
/// greater than everything seen so far; `update` folds in a remote timestamp
/// so causality is preserved across nodes.
#[derive(Debug)]
pub struct HlcClock {
    node_id: String,
    state: Mutex<ClockState>,
}

impl HlcClock {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            state: Mutex::new(ClockState::default()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Produces the next timestamp for a local event.
    pub fn tick(&self) -> Timestamp {
        let wall = wall_clock_ms();
        let mut state = self.state.lock();
        if wall > state.last_millis {
            state.last_millis = wall;
            state.counter = 0;
        } else {
            state.counter = state.counter.saturating_add(1);
        }
        Timestamp::new(state.last_millis, state.counter, self.node_id.clone())
    }

    /// Folds a remote timestamp into the clock. The next `tick` is guaranteed
    /// to be greater than both the local state and `remote`.
    pub fn update(&self, remote: &Timestamp) {
        let wall = wall_clock_ms();
        let mut state = self.state.lock();
        let max_millis = wall.max(state.last_millis).max(remote.millis);
        if max_millis == state.last_millis && max_millis == remote.millis {
            state.counter = state.counter.max(remote.counter).saturating_add(1);
        } else if max_millis == remote.millis {
            state.last_millis = remote.millis;
            state.counter = remote.counter.saturating_add(1);
        } else if max_millis == state.last_millis {
            state.counter = state.counter.saturating_add(1);
        } else {
            state.last_millis = max_millis;
            state.counter = 0;
        }
    }

    /// Reads the current clock position without advancing it.
    pub fn current(&self) -> Timestamp {
        let state = self.state.lock();
        Timestamp::new(
            state.last_millis.max(wall_clock_ms()),
            state.counter,
            self.node_id.clone(),
        )
    }
}

