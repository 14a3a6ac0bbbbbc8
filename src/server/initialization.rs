// src/server/initialization.rs

//! Startup wiring: shared state, the client listener, and optional TLS.

use super::context::ServerContext;
use crate::config::Config;
use crate::core::cluster::LoopbackTransport;
use crate::core::state::ServerState;
use crate::core::storage::MemoryStorage;
use anyhow::{Context as _, Result};
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::ServerConfig as RustlsServerConfig;
use tracing::info;

/// Builds the shared state, binds the client listener, and prepares TLS.
pub async fn setup(mut config: Config) -> Result<ServerContext> {
    // Pin the node identity before anything derives from it.
    let node_id = config.effective_node_id();
    config.node_id = Some(node_id.clone());

    // The production deployment plugs its storage driver and cluster
    // transport in here; standalone mode runs on the in-process ones.
    let transport = Arc::new(LoopbackTransport::new(node_id.clone()));
    let inbox = transport.register(node_id.clone());

    let state = ServerState::initialize(config, Arc::new(MemoryStorage::new()), transport);

    // Pump the local transport inbox into the cluster event handler.
    {
        let state = state.clone();
        let mut inbox = inbox;
        let mut shutdown_rx = state.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => return,
                    received = inbox.recv() => {
                        let Some((sender, message)) = received else { return };
                        crate::core::cluster::events::handle_peer_message(&state, sender, message)
                            .await;
                    }
                }
            }
        });
    }

    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind client listener on {addr}"))?;
    info!("Client listener bound on {}", addr);

    let acceptor = if state.config.tls.enabled {
        Some(build_tls_acceptor(&state.config)?)
    } else {
        None
    };

    let shutdown_tx = state.shutdown_tx.clone();
    Ok(ServerContext {
        state,
        listener,
        acceptor,
        background_tasks: JoinSet::new(),
        shutdown_tx,
    })
}

fn build_tls_acceptor(config: &Config) -> Result<TlsAcceptor> {
    let cert_path = config
        .tls
        .cert_file
        .as_deref()
        .context("tls.cert_file is required")?;
    let key_path = config
        .tls
        .key_file
        .as_deref()
        .context("tls.key_file is required")?;

    let certs = rustls_pemfile::certs(&mut BufReader::new(
        File::open(cert_path).with_context(|| format!("failed to open {cert_path}"))?,
    ))
    .collect::<std::result::Result<Vec<_>, _>>()
    .context("failed to parse TLS certificates")?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(
        File::open(key_path).with_context(|| format!("failed to open {key_path}"))?,
    ))
    .context("failed to parse TLS private key")?
    .context("no private key found")?;

    let tls_config = RustlsServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid TLS certificate/key pair")?;
    info!("TLS enabled for the client listener");
    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}
