// src/core/tasks/lock_sweeper.rs

//! Expires overdue lock grants and promotes their waiters.

use crate::core::handler::adapters::route_lock_grant;
use crate::core::state::ServerState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time;
use tracing::info;

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

pub async fn run(state: Arc<ServerState>, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut interval = time::interval(SWEEP_INTERVAL);
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Lock sweeper shutting down.");
                return;
            }
            _ = interval.tick() => {
                for grant in state.locks.expire_due() {
                    route_lock_grant(&state, grant).await;
                }
            }
        }
    }
}
