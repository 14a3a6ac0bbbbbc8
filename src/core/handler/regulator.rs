// src/core/handler/regulator.rs

//! Admission-control backpressure for the async write pipeline.
//!
//! The regulator tracks pending async ops. `register_pending` refuses new
//! work when saturated; `should_force_sync` signals the batch processor to
//! drain synchronously before the hard limit is hit.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

#[derive(Debug)]
pub struct PipelineRegulator {
    pending: AtomicUsize,
    max_pending: usize,
    force_sync_threshold: usize,
    capacity_freed: Notify,
}

impl PipelineRegulator {
    pub fn new(max_pending: usize, force_sync_threshold: usize) -> Self {
        Self {
            pending: AtomicUsize::new(0),
            max_pending,
            force_sync_threshold,
            capacity_freed: Notify::new(),
        }
    }

    /// Claims one pending slot. Returns `false` when saturated.
    pub fn register_pending(&self) -> bool {
        let mut current = self.pending.load(Ordering::Acquire);
        loop {
            if current >= self.max_pending {
                return false;
            }
            match self.pending.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Releases one pending slot and wakes capacity waiters.
    pub fn complete(&self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
        self.capacity_freed.notify_waiters();
    }

    /// True when the pipeline should drain synchronously.
    pub fn should_force_sync(&self) -> bool {
        self.pending.load(Ordering::Acquire) >= self.force_sync_threshold
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Waits up to `max_wait` for a pending slot. Returns `true` with the
    /// slot claimed, or `false` on timeout.
    pub async fn wait_for_capacity(&self, max_wait: Duration) -> bool {
        let deadline = Instant::now() + max_wait;
        loop {
            if self.register_pending() {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let _ = tokio::time::timeout(remaining, self.capacity_freed.notified()).await;
        }
    }
}

