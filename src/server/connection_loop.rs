// src/server/connection_loop.rs

//! The accept loop, the TCP/TLS client transport, and the per-connection
//! session task.

use super::context::ServerContext;
use crate::connection::CoalescingWriter;
use crate::core::handler::{close_session, router};
use crate::core::metrics;
use crate::core::protocol::codec::FrameCodec;
use crate::core::protocol::{ServerMessage, close_code};
use crate::core::state::ServerState;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_rustls::server::TlsStream;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// The accepted client transport, plain or TLS, so the frame codec is
/// oblivious to the handshake that produced it.
enum ClientStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

/// Both variants are `Unpin`, so the poll impls can project through one
/// trait object instead of matching in every method.
trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<S: AsyncRead + AsyncWrite + Unpin + Send> Transport for S {}

impl ClientStream {
    fn transport(&mut self) -> &mut dyn Transport {
        match self {
            ClientStream::Plain(stream) => stream,
            ClientStream::Tls(stream) => stream.as_mut(),
        }
    }
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(self.get_mut().transport()).poll_read(cx, buf)
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(self.get_mut().transport()).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(self.get_mut().transport()).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(self.get_mut().transport()).poll_shutdown(cx)
    }
}

/// Waits for SIGINT or SIGTERM.
async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to create SIGINT stream");
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to create SIGTERM stream");
        tokio::select! {
            _ = sigint.recv() => info!("SIGINT received, initiating graceful shutdown."),
            _ = sigterm.recv() => info!("SIGTERM received, initiating graceful shutdown."),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Ctrl-C received, initiating graceful shutdown.");
    }
}

/// The main accept loop. Runs until a shutdown signal arrives.
pub async fn run(mut ctx: ServerContext) {
    let mut client_tasks = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            _ = await_shutdown_signal() => break,

            Some(res) = ctx.background_tasks.join_next() => {
                if let Err(e) = res {
                    error!("Background task panicked: {e:?}. Shutting down.");
                    break;
                }
                info!("A background task has completed.");
            }

            res = ctx.listener.accept() => {
                match res {
                    Ok((socket, addr)) => {
                        accept_connection(&mut client_tasks, &ctx, socket, addr);
                    }
                    Err(e) => error!("Failed to accept connection: {}", e),
                }
            }

            Some(res) = client_tasks.join_next() => {
                if let Err(e) = res
                    && e.is_panic()
                {
                    error!("A session task panicked: {e:?}");
                }
            }
        }
    }

    info!("Shutting down. Sending signal to all tasks.");
    let _ = ctx.shutdown_tx.send(());
    client_tasks.shutdown().await;
    info!("All client connections closed.");
    while ctx.background_tasks.join_next().await.is_some() {}
    info!("Server shutdown complete.");
}

fn accept_connection(
    client_tasks: &mut JoinSet<()>,
    ctx: &ServerContext,
    socket: TcpStream,
    addr: SocketAddr,
) {
    let state = ctx.state.clone();
    metrics::CONNECTIONS_RECEIVED_TOTAL.inc();

    // Admission control happens before any handshake work.
    if !state.rate_limiter.should_accept() {
        state.rate_limiter.on_rejected();
        warn!("Rejecting connection from {}: admission control", addr);
        client_tasks.spawn(async move {
            let mut framed = Framed::new(ClientStream::Plain(socket), FrameCodec);
            send_close_frame(&mut framed, close_code::OVERLOADED, "Try Again Later").await;
        });
        return;
    }
    state.rate_limiter.on_attempt();

    let acceptor = ctx.acceptor.clone();
    let shutdown_rx = ctx.shutdown_tx.subscribe();
    client_tasks.spawn(async move {
        let stream = match acceptor {
            Some(acceptor) => match acceptor.accept(socket).await {
                Ok(tls_stream) => ClientStream::Tls(Box::new(tls_stream)),
                Err(e) => {
                    warn!("TLS handshake error for {}: {}", addr, e);
                    state.rate_limiter.on_failed();
                    return;
                }
            },
            None => ClientStream::Plain(socket),
        };
        run_session(state, stream, addr, shutdown_rx).await;
    });
}

/// One task per connection: owns the framed transport, feeds the writer task,
/// and routes inbound frames until close.
async fn run_session(
    state: Arc<ServerState>,
    stream: ClientStream,
    addr: SocketAddr,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let framed = Framed::new(stream, FrameCodec);
    let (mut sink, mut inbound) = framed.split::<Bytes>();

    // The writer task owns the sink; the coalescing writer feeds it.
    let (sink_tx, mut sink_rx) = mpsc::unbounded_channel::<Bytes>();
    let writer_task = tokio::spawn(async move {
        while let Some(payload) = sink_rx.recv().await {
            if sink.send(payload).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let writer = CoalescingWriter::new(sink_tx, state.writer_config);
    let (close_tx, mut close_rx) = mpsc::unbounded_channel();
    let session = state.connections.register(Some(addr), writer, close_tx);
    // An idle session must not hold GC back behind the epoch.
    session.observe_hlc(&state.clock.current());
    info!("Accepted connection from {} as session {}", addr, session.id);

    // Connection interceptors may veto the session outright.
    for interceptor in state.interceptors() {
        if !interceptor.on_connect(session.id).await {
            warn!("Session {} rejected by connection interceptor", session.id);
            session
                .writer
                .write(&ServerMessage::error(close_code::REJECTED, "Connection rejected"), true);
            finish_session(&state, session.id).await;
            // The writer task drains the final frames and exits once the
            // last sender is dropped.
            return;
        }
    }

    // The first server frame after accept.
    session.writer.write(&ServerMessage::AuthRequired, true);

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.recv() => {
                debug!("Session {} closing for server shutdown", session.id);
                break;
            }

            closed = close_rx.recv() => {
                if let Some((code, reason)) = closed {
                    debug!("Session {} closing with code {}: {}", session.id, code, reason);
                    session.writer.write(&ServerMessage::error(code, reason), true);
                }
                break;
            }

            frame = inbound.next() => {
                match frame {
                    Some(Ok(payload)) => {
                        router::handle_frame(&state, &session, payload).await;
                    }
                    Some(Err(e)) => {
                        debug!("Session {} protocol error: {}", session.id, e);
                        session.writer.write(
                            &ServerMessage::error(close_code::PROTOCOL_ERROR, e.to_string()),
                            true,
                        );
                        break;
                    }
                    None => {
                        debug!("Session {} closed by peer", session.id);
                        break;
                    }
                }
            }
        }
    }

    finish_session(&state, session.id).await;
    // The writer task drains whatever the close flush queued and exits once
    // every sender handle is gone.
    drop(session);
    let _ = writer_task;
}

async fn finish_session(state: &Arc<ServerState>, session_id: u64) {
    if let Some(session) = state.connections.get(session_id)
        && !session.is_authenticated()
    {
        state.rate_limiter.on_failed();
    }
    close_session(state, session_id).await;
}

async fn send_close_frame(
    framed: &mut Framed<ClientStream, FrameCodec>,
    code: u16,
    reason: &str,
) {
    let message = ServerMessage::error(code, reason);
    if let Ok(payload) =
        crate::core::protocol::codec::encode_server_message(&message, Default::default())
    {
        let _ = framed.send(payload).await;
    }
    let _ = framed.close().await;
}
