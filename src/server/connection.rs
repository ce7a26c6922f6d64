//! Per-connection tasks for the raw TCP transport, plus the pieces both
//! transports share (registration, inbound unit handling, teardown).
//!
//! DESIGN
//! ======
//! Every connection runs a reader loop in its own task and a writer task fed
//! by the connection's bounded outbound channel. The reader exits on peer
//! close, read error, eviction (closer notified) or server shutdown; it then
//! deregisters the connection and aborts the writer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::Server;
use super::framing::{self, Decoded, FrameDecoder};
use super::registry::{ClientConnection, ConnectionId, Outbound, Transport};
use crate::config::FramingMode;
use crate::error::peer_label;
use crate::message::Message;

const READ_CHUNK: usize = 8 * 1024;

/// Back-off after a failed `accept` (e.g. descriptor exhaustion).
const ACCEPT_RETRY: Duration = Duration::from_millis(100);

// =============================================================================
// SHARED
// =============================================================================

/// A freshly registered connection, owned by its transport task.
pub(super) struct Registered {
    pub id: ConnectionId,
    pub rx: mpsc::Receiver<Outbound>,
    pub closer: Arc<Notify>,
}

/// Register a new peer under a fresh id and queue its welcome message.
pub(super) fn register(server: &Server, peer: Option<SocketAddr>, transport: Transport) -> Registered {
    let (tx, rx) = mpsc::channel(server.inner.config.outbound_buffer);
    let closer = Arc::new(Notify::new());

    let id = loop {
        let id = ConnectionId::new();
        let conn = ClientConnection::new(id, tx.clone(), peer, transport, closer.clone());
        if server.registry().insert(conn) {
            break id;
        }
    };
    drop(tx);

    info!(%id, peer = %peer_label(peer), %transport, "server: client connected");
    server.send_to_client(id, Message::welcome(&id.to_string()));
    Registered { id, rx, closer }
}

/// Act on one decoded inbound unit.
pub(super) async fn handle_decoded(server: &Server, id: ConnectionId, item: Decoded) {
    server.registry().touch(id, Instant::now());
    match item {
        Decoded::Ping => {
            server.deliver(id, Outbound::Pong);
        }
        Decoded::Invalid(err) => {
            warn!(%id, error = %err, "server: invalid inbound frame");
            server.send_to_client(id, Message::error_from(&err));
        }
        Decoded::Message(msg) => server.handle_message(id, msg).await,
    }
}

/// Deregister after the reader exits. Quiet if the connection was already
/// evicted elsewhere.
pub(super) fn teardown(server: &Server, id: ConnectionId, reason: &str) {
    let removed = server.registry().remove(id);
    if let Some(conn) = removed {
        conn.close();
    }
    info!(%id, reason, "server: client disconnected");
}

// =============================================================================
// TCP
// =============================================================================

pub(super) async fn accept_loop(server: Server, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    sessions.spawn(run_tcp(server.clone(), stream, peer, shutdown.clone()));
                }
                Err(e) => {
                    warn!(error = %e, "server: accept failed");
                    tokio::time::sleep(ACCEPT_RETRY).await;
                }
            },
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
        }
    }

    // Sessions observe the same shutdown signal and exit promptly.
    while sessions.join_next().await.is_some() {}
}

async fn run_tcp(server: Server, stream: TcpStream, peer: SocketAddr, mut shutdown: watch::Receiver<bool>) {
    if *shutdown.borrow_and_update() {
        return;
    }
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "server: set_nodelay failed");
    }

    let config = &server.inner.config;
    let mode = config.framing;
    let (mut reader, writer) = stream.into_split();
    let Registered { id, rx, closer } = register(&server, Some(peer), Transport::Tcp);
    let writer = tokio::spawn(write_tcp(server.clone(), id, writer, rx, mode));

    let mut decoder = FrameDecoder::new(mode, config.max_message_size);
    let mut chunk = vec![0u8; READ_CHUNK];
    let reason = loop {
        tokio::select! {
            () = closer.notified() => break "evicted",
            _ = shutdown.changed() => break "server shutdown",
            read = reader.read(&mut chunk) => match read {
                Ok(0) => break "peer closed",
                Ok(n) => {
                    for item in decoder.push(&chunk[..n]) {
                        handle_decoded(&server, id, item).await;
                    }
                }
                Err(e) => {
                    debug!(%id, error = %e, "server: read failed");
                    break "read failed";
                }
            },
        }
    };

    teardown(&server, id, reason);
    writer.abort();
    let _ = writer.await;
}

async fn write_tcp(
    server: Server,
    id: ConnectionId,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Outbound>,
    mode: FramingMode,
) {
    while let Some(out) = rx.recv().await {
        let bytes = match out {
            Outbound::Pong => framing::pong(mode).to_vec(),
            Outbound::Message(msg) => match framing::encode(mode, &msg) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(%id, error = %e, "server: failed to encode outbound message");
                    continue;
                }
            },
        };
        if let Err(e) = writer.write_all(&bytes).await {
            debug!(%id, error = %e, "server: write failed");
            server.evict(id, "write failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
}
