// src/server/spawner.rs

//! Spawns every background task once the context is assembled.

use super::context::ServerContext;
use super::{http, metrics_server};
use crate::core::tasks;
use anyhow::Result;
use tracing::info;

pub async fn spawn_all(ctx: &mut ServerContext) -> Result<()> {
    let state = ctx.state.clone();

    ctx.background_tasks.spawn(tasks::heartbeat::run(
        state.clone(),
        ctx.shutdown_tx.subscribe(),
    ));
    ctx.background_tasks
        .spawn(tasks::gc::run(state.clone(), ctx.shutdown_tx.subscribe()));
    ctx.background_tasks.spawn(tasks::lock_sweeper::run(
        state.clone(),
        ctx.shutdown_tx.subscribe(),
    ));

    if state.config.http.enabled {
        ctx.background_tasks
            .spawn(http::run(state.clone(), ctx.shutdown_tx.subscribe()));
    }
    if state.config.metrics.enabled {
        ctx.background_tasks.spawn(metrics_server::run(
            state.clone(),
            ctx.shutdown_tx.subscribe(),
        ));
    }

    info!("Background tasks spawned.");
    Ok(())
}
