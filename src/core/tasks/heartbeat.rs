// src/core/tasks/heartbeat.rs

//! The heartbeat reaper: evicts sessions that have gone silent.

use crate::core::handler::close_session;
use crate::core::metrics;
use crate::core::protocol::close_code;
use crate::core::state::ServerState;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time;
use tracing::{info, warn};

/// Scans authenticated sessions every check interval and closes any whose
/// last ping is older than the heartbeat timeout with code 4002. The shared
/// session close handler does all other cleanup.
pub async fn run(state: Arc<ServerState>, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut interval = time::interval(state.config.heartbeat.check_interval);
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    info!(
        "Heartbeat reaper running every {:?} with a {:?} timeout",
        state.config.heartbeat.check_interval, state.config.heartbeat.timeout
    );
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Heartbeat reaper shutting down.");
                return;
            }
            _ = interval.tick() => {
                reap_silent_sessions(&state).await;
            }
        }
    }
}

async fn reap_silent_sessions(state: &Arc<ServerState>) {
    let timeout = state.config.heartbeat.timeout;
    for session in state.connections.authenticated_sessions() {
        if session.idle_time() > timeout {
            warn!(
                "Session {} silent for {:?}; closing with heartbeat timeout",
                session.id,
                session.idle_time()
            );
            metrics::HEARTBEAT_EVICTIONS_TOTAL.inc();
            session.close(close_code::HEARTBEAT_TIMEOUT, "Heartbeat timeout");
            close_session(state, session.id).await;
        }
    }
}
