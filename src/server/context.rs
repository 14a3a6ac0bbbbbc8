// src/server/context.rs

//! The assembled server context handed from initialization to the spawner
//! and the accept loop.

use crate::core::state::ServerState;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;

pub struct ServerContext {
    pub state: Arc<ServerState>,
    pub listener: TcpListener,
    pub acceptor: Option<TlsAcceptor>,
    pub background_tasks: JoinSet<()>,
    pub shutdown_tx: broadcast::Sender<()>,
}
