// src/core/handler/write_concern.rs

//! Per-op acknowledgement bookkeeping for deferred Write Concerns.
//!
//! The ladder is MEMORY -> APPLIED -> REPLICATED -> PERSISTED. A pending
//! write records the highest level reached so far; it resolves successfully
//! when the target level is reached, or fails on rejection or timeout with
//! the achieved level attached.

use crate::core::protocol::{OpResult, WriteConcern};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

#[derive(Debug)]
struct PendingState {
    achieved: WriteConcern,
    resolver: Option<oneshot::Sender<OpResult>>,
}

/// One deferred write awaiting its target level.
#[derive(Debug)]
pub struct PendingWrite {
    pub op_id: String,
    pub target: WriteConcern,
    state: Mutex<PendingState>,
}

impl PendingWrite {
    fn resolve(&self, result: OpResult) {
        let resolver = self.state.lock().resolver.take();
        if let Some(tx) = resolver {
            let _ = tx.send(result);
        }
    }
}

/// Owner of all pending writes on this node.
#[derive(Debug, Default)]
pub struct WriteConcernTracker {
    pending: DashMap<String, Arc<PendingWrite>>,
}

impl WriteConcernTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a pending write and arms its deadline. The returned receiver
    /// resolves exactly once, at success, failure, or timeout.
    pub fn register(
        self: &Arc<Self>,
        op_id: &str,
        target: WriteConcern,
        timeout: Duration,
    ) -> oneshot::Receiver<OpResult> {
        let (tx, rx) = oneshot::channel();
        let pending = Arc::new(PendingWrite {
            op_id: op_id.to_string(),
            target,
            state: Mutex::new(PendingState {
                achieved: WriteConcern::Memory,
                resolver: Some(tx),
            }),
        });
        self.pending.insert(op_id.to_string(), pending);

        let tracker = self.clone();
        let op_id = op_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            tracker.fail(&op_id, "Write concern timeout");
        });
        rx
    }

    /// Marks `level` reached. Levels are recorded monotonically, so a late
    /// lower-level notification never regresses the achieved level. Resolves
    /// the write when the target is reached.
    pub fn notify(&self, op_id: &str, level: WriteConcern) {
        let Some(pending) = self.pending.get(op_id).map(|e| e.value().clone()) else {
            return;
        };
        let resolved = {
            let mut state = pending.state.lock();
            if level > state.achieved {
                state.achieved = level;
            }
            state.achieved >= pending.target
        };
        if resolved {
            self.pending.remove(op_id);
            let achieved = pending.state.lock().achieved;
            pending.resolve(OpResult {
                id: pending.op_id.clone(),
                success: true,
                error: None,
                achieved_level: achieved,
            });
        }
    }

    /// Fails the write with the achieved level attached. Idempotent; a write
    /// that already resolved is untouched.
    pub fn fail(&self, op_id: &str, error: &str) {
        let Some((_, pending)) = self.pending.remove(op_id) else {
            return;
        };
        let achieved = pending.state.lock().achieved;
        debug!(
            "Pending write '{}' failed at level {}: {}",
            op_id, achieved, error
        );
        pending.resolve(OpResult {
            id: pending.op_id.clone(),
            success: false,
            error: Some(error.to_string()),
            achieved_level: achieved,
        });
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

