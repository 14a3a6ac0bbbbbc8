// src/connection/session.rs

//! Defines the state associated with a single client session.

use super::writer::CoalescingWriter;
use crate::core::crdt::Timestamp;
use crate::core::permissions::{DEFAULT_ROLE, Principal};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// A request to close the underlying transport with a code and reason.
pub type CloseSignal = mpsc::UnboundedSender<(u16, String)>;

/// One open transport connection. Created on connect, removed on close or
/// heartbeat eviction; exclusively owned by the [`ConnectionManager`].
///
/// [`ConnectionManager`]: super::manager::ConnectionManager
#[derive(Debug)]
pub struct Session {
    pub id: u64,
    pub remote_addr: Option<SocketAddr>,
    pub writer: Arc<CoalescingWriter>,
    close_signal: CloseSignal,
    closing: AtomicBool,
    authenticated: AtomicBool,
    principal: RwLock<Option<Arc<Principal>>>,
    /// Active query subscription ids owned by this session.
    pub subscriptions: RwLock<HashSet<String>>,
    /// Last HLC observed from this client, fed into GC consensus.
    last_hlc: RwLock<Timestamp>,
    last_ping: RwLock<Instant>,
}

impl Session {
    pub fn new(
        id: u64,
        remote_addr: Option<SocketAddr>,
        writer: Arc<CoalescingWriter>,
        close_signal: CloseSignal,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            remote_addr,
            writer,
            close_signal,
            closing: AtomicBool::new(false),
            authenticated: AtomicBool::new(false),
            principal: RwLock::new(None),
            subscriptions: RwLock::new(HashSet::new()),
            last_hlc: RwLock::new(Timestamp::zero()),
            last_ping: RwLock::new(Instant::now()),
        })
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    /// Attaches the verified principal and flips the authenticated flag.
    pub fn set_authenticated(&self, principal: Arc<Principal>) {
        *self.principal.write() = Some(principal);
        self.authenticated.store(true, Ordering::Release);
    }

    pub fn principal(&self) -> Option<Arc<Principal>> {
        self.principal.read().clone()
    }

    /// Role signature used as the broadcast serialization cache key.
    pub fn role_signature(&self) -> String {
        self.principal()
            .map(|p| p.role_signature())
            .unwrap_or_else(|| DEFAULT_ROLE.to_string())
    }

    /// Advances the session's last observed HLC (monotonic).
    pub fn observe_hlc(&self, timestamp: &Timestamp) {
        let mut last = self.last_hlc.write();
        if *timestamp > *last {
            *last = timestamp.clone();
        }
    }

    pub fn last_hlc(&self) -> Timestamp {
        self.last_hlc.read().clone()
    }

    pub fn record_ping(&self) {
        *self.last_ping.write() = Instant::now();
    }

    pub fn idle_time(&self) -> Duration {
        self.last_ping.read().elapsed()
    }

    /// Requests a transport close. The connection loop performs the actual
    /// shutdown and runs the shared cleanup path; calling this twice is
    /// harmless.
    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.close_signal.send((code, reason.to_string()));
    }

    /// Claims the close path. Only the first caller gets `true`, which keeps
    /// the cleanup sequence single-shot even when the reaper and the
    /// connection loop race.
    pub fn begin_close(&self) -> bool {
        !self.closing.swap(true, Ordering::AcqRel)
    }
}
