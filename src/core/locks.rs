// src/core/locks.rs

//! Distributed lock bookkeeping for the locally owned portion of the lock
//! namespace. Lock names are partitioned like map keys; requests for remotely
//! owned names are forwarded by the handler layer.
//!
//! Grants carry a monotonically increasing fencing token so stale holders can
//! be detected downstream. Holders are composite ids `"{node_id}:{session_id}"`,
//! which is how a grant finds its way back to the originating session.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(10);

/// A grant to hand back to a (possibly remote) requester.
#[derive(Debug, Clone, PartialEq)]
pub struct LockGrant {
    pub name: String,
    pub holder: String,
    pub request_id: String,
    pub fencing_token: u64,
}

#[derive(Debug)]
struct Waiter {
    holder: String,
    request_id: String,
    ttl: Duration,
}

#[derive(Debug)]
struct LockState {
    holder: String,
    request_id: String,
    fencing_token: u64,
    deadline: Instant,
    waiters: VecDeque<Waiter>,
}

/// Builds a composite holder id.
pub fn composite_holder(node_id: &str, session_id: u64) -> String {
    format!("{node_id}:{session_id}")
}

/// The lock table for locally owned lock names.
#[derive(Debug, Default)]
pub struct LockManager {
    locks: DashMap<String, Mutex<Option<LockState>>>,
    fencing_counter: AtomicU64,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_token(&self) -> u64 {
        self.fencing_counter.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Attempts to acquire `name` for `holder`. Returns the grant when the
    /// lock is free (or the previous grant expired); otherwise the request is
    /// queued and the grant is delivered on release or expiry.
    pub fn acquire(
        &self,
        name: &str,
        holder: &str,
        request_id: &str,
        ttl: Duration,
    ) -> Option<LockGrant> {
        let slot = self.locks.entry(name.to_string()).or_default();
        let mut state = slot.lock();
        let now = Instant::now();
        match state.as_mut() {
            Some(current) if current.deadline > now => {
                if current.holder == holder {
                    // Re-entrant refresh: same holder extends the deadline.
                    current.deadline = now + ttl;
                    return Some(LockGrant {
                        name: name.to_string(),
                        holder: holder.to_string(),
                        request_id: request_id.to_string(),
                        fencing_token: current.fencing_token,
                    });
                }
                current.waiters.push_back(Waiter {
                    holder: holder.to_string(),
                    request_id: request_id.to_string(),
                    ttl,
                });
                None
            }
            _ => {
                let token = self.next_token();
                *state = Some(LockState {
                    holder: holder.to_string(),
                    request_id: request_id.to_string(),
                    fencing_token: token,
                    deadline: now + ttl,
                    waiters: state.take().map(|s| s.waiters).unwrap_or_default(),
                });
                Some(LockGrant {
                    name: name.to_string(),
                    holder: holder.to_string(),
                    request_id: request_id.to_string(),
                    fencing_token: token,
                })
            }
        }
    }

    /// Releases `name` if `holder` owns it. Returns the follow-up grant for
    /// the next waiter, if any.
    pub fn release(&self, name: &str, holder: &str) -> Option<LockGrant> {
        let slot = self.locks.get(name)?;
        let mut state = slot.lock();
        let current = state.as_mut()?;
        if current.holder != holder {
            return None;
        }
        self.promote_next(name, &mut state)
    }

    /// Releases every lock held by `holder` and returns the follow-up grants.
    /// Driven by session close and `CLUSTER_CLIENT_DISCONNECTED`.
    pub fn release_all_for(&self, holder: &str) -> Vec<LockGrant> {
        let names: Vec<String> = self
            .locks
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .lock()
                    .as_ref()
                    .is_some_and(|state| state.holder == holder)
            })
            .map(|entry| entry.key().clone())
            .collect();
        let mut grants = Vec::new();
        for name in names {
            // Also drop any queued waits from the same holder.
            if let Some(slot) = self.locks.get(&name) {
                let mut state = slot.lock();
                if let Some(current) = state.as_mut() {
                    current.waiters.retain(|w| w.holder != holder);
                }
            }
            if let Some(grant) = self.release(&name, holder) {
                grants.push(grant);
            }
        }
        grants
    }

    /// Expires overdue grants and promotes their next waiters. Called by the
    /// lock TTL sweeper.
    pub fn expire_due(&self) -> Vec<LockGrant> {
        let now = Instant::now();
        let mut grants = Vec::new();
        let names: Vec<String> = self.locks.iter().map(|e| e.key().clone()).collect();
        for name in names {
            let Some(slot) = self.locks.get(&name) else {
                continue;
            };
            let mut state = slot.lock();
            let expired = state.as_ref().is_some_and(|s| s.deadline <= now);
            if expired && let Some(grant) = self.promote_next(&name, &mut state) {
                grants.push(grant);
            }
        }
        grants
    }

    /// The current holder of `name`, if the grant is live.
    pub fn holder(&self, name: &str) -> Option<(String, u64)> {
        let slot = self.locks.get(name)?;
        let state = slot.lock();
        let current = state.as_ref()?;
        (current.deadline > Instant::now())
            .then(|| (current.holder.clone(), current.fencing_token))
    }

    fn promote_next(&self, name: &str, state: &mut Option<LockState>) -> Option<LockGrant> {
        let mut waiters = state.take().map(|s| s.waiters).unwrap_or_default();
        let next = waiters.pop_front()?;
        let token = self.next_token();
        *state = Some(LockState {
            holder: next.holder.clone(),
            request_id: next.request_id.clone(),
            fencing_token: token,
            deadline: Instant::now() + next.ttl,
            waiters,
        });
        Some(LockGrant {
            name: name.to_string(),
            holder: next.holder,
            request_id: next.request_id,
            fencing_token: token,
        })
    }
}

