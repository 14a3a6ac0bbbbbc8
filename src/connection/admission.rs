// src/connection/admission.rs

//! Connection admission control: a sliding one-second window of completed
//! connections plus a cap on pending (unauthenticated) attempts.

use crate::core::metrics;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(1);

/// Accepts or rejects new transport connections. Rejected connections are
/// closed with transport code 1013 (Try Again Later) by the caller.
#[derive(Debug)]
pub struct ConnectionRateLimiter {
    max_per_second: usize,
    max_pending: usize,
    completed: Mutex<VecDeque<Instant>>,
    pending: AtomicUsize,
    rejected: AtomicU64,
}

impl ConnectionRateLimiter {
    pub fn new(max_per_second: usize, max_pending: usize) -> Self {
        Self {
            max_per_second,
            max_pending,
            completed: Mutex::new(VecDeque::new()),
            pending: AtomicUsize::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    fn completed_in_window(&self) -> usize {
        let mut completed = self.completed.lock();
        let cutoff = Instant::now() - WINDOW;
        while completed.front().is_some_and(|t| *t < cutoff) {
            completed.pop_front();
        }
        completed.len()
    }

    /// The admission decision. Accept iff the completed-connection window and
    /// the pending-attempt count both have room.
    pub fn should_accept(&self) -> bool {
        self.completed_in_window() < self.max_per_second
            && self.pending.load(Ordering::Acquire) < self.max_pending
    }

    /// A new connection attempt was admitted and is awaiting authentication.
    pub fn on_attempt(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    /// The attempt authenticated successfully.
    pub fn on_established(&self) {
        let _ = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| p.checked_sub(1));
        self.completed.lock().push_back(Instant::now());
    }

    /// The attempt failed before authenticating (bad token, early close).
    pub fn on_failed(&self) {
        let _ = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| p.checked_sub(1));
    }

    /// The connection was refused outright.
    pub fn on_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        metrics::CONNECTIONS_REJECTED_TOTAL.inc();
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn rejected_total(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

