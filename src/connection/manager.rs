// src/connection/manager.rs

//! Owns the session table: registration, removal, heartbeat bookkeeping, and
//! simple raw broadcast.

use super::session::{CloseSignal, Session};
use super::writer::CoalescingWriter;
use crate::core::metrics;
use crate::core::permissions::Principal;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

type SessionCallback = Box<dyn Fn(&Arc<Session>) + Send + Sync>;

/// The session table. Sole writer of session entries; everything else holds
/// read-only `Arc<Session>` views.
pub struct ConnectionManager {
    sessions: DashMap<u64, Arc<Session>>,
    next_id: AtomicU64,
    heartbeat_timeout: Duration,
    on_register: RwLock<Option<SessionCallback>>,
    on_remove: RwLock<Option<SessionCallback>>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("sessions", &self.sessions.len())
            .field("heartbeat_timeout", &self.heartbeat_timeout)
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            next_id: AtomicU64::new(1),
            heartbeat_timeout,
            on_register: RwLock::new(None),
            on_remove: RwLock::new(None),
        }
    }

    pub fn set_on_register(&self, callback: SessionCallback) {
        *self.on_register.write() = Some(callback);
    }

    pub fn set_on_remove(&self, callback: SessionCallback) {
        *self.on_remove.write() = Some(callback);
    }

    /// Assigns an id, stores the session, and fires the registration callback.
    pub fn register(
        &self,
        remote_addr: Option<SocketAddr>,
        writer: Arc<CoalescingWriter>,
        close_signal: CloseSignal,
    ) -> Arc<Session> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Session::new(id, remote_addr, writer, close_signal);
        self.sessions.insert(id, session.clone());
        metrics::CONNECTED_SESSIONS.set(self.sessions.len() as f64);
        if let Some(callback) = self.on_register.read().as_ref() {
            callback(&session);
        }
        session
    }

    /// Drops the session and fires the removal callback. Returns the removed
    /// record so the caller can finish cleanup. Idempotent.
    pub fn remove(&self, id: u64) -> Option<Arc<Session>> {
        let (_, session) = self.sessions.remove(&id)?;
        metrics::CONNECTED_SESSIONS.set(self.sessions.len() as f64);
        if let Some(callback) = self.on_remove.read().as_ref() {
            callback(&session);
        }
        Some(session)
    }

    pub fn get(&self, id: u64) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|e| e.value().clone())
    }

    pub fn set_authenticated(&self, id: u64, principal: Arc<Principal>) {
        if let Some(session) = self.get(id) {
            session.set_authenticated(principal);
        }
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn all_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    pub fn authenticated_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .iter()
            .filter(|e| e.value().is_authenticated())
            .map(|e| e.value().clone())
            .collect()
    }

    /// Writes a preserialized frame to every open session.
    pub fn broadcast_raw(&self, payload: &Bytes, exclude: Option<u64>) {
        for session in self.sessions.iter() {
            if Some(*session.key()) == exclude {
                continue;
            }
            session.value().writer.write_raw(payload.clone(), false);
        }
    }

    // --- Heartbeat helpers ---

    pub fn is_alive(&self, id: u64) -> bool {
        self.get(id)
            .is_some_and(|s| s.idle_time() < self.heartbeat_timeout)
    }

    pub fn update_last_ping(&self, id: u64) {
        if let Some(session) = self.get(id) {
            session.record_ping();
        }
    }

    pub fn idle_time(&self, id: u64) -> Option<Duration> {
        self.get(id).map(|s| s.idle_time())
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }
}

