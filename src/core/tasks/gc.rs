// src/core/tasks/gc.rs

//! Periodic driver for the GC consensus rounds.

use crate::core::cluster::gc;
use crate::core::state::ServerState;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time;
use tracing::info;

pub async fn run(state: Arc<ServerState>, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut interval = time::interval(state.config.gc.interval);
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so a restart does not run GC
    // before the node has settled.
    interval.tick().await;
    info!("GC consensus driver running every {:?}", state.config.gc.interval);
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("GC consensus driver shutting down.");
                return;
            }
            _ = interval.tick() => {
                gc::run_round(&state).await;
            }
        }
    }
}
