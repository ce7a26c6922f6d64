//! WebSocket transport: axum endpoint feeding the shared registry.
//!
//! DESIGN
//! ======
//! `/ws` upgrades and runs the same lifecycle as a TCP peer: fresh id,
//! welcome, reader loop, writer task. Each text or binary frame is one
//! unit, so no stream framing is involved. `/healthz` answers 200 for load
//! balancers.

use std::net::SocketAddr;

use axum::Router;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use futures::stream::SplitSink;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use super::Server;
use super::connection::{Registered, handle_decoded, register, teardown};
use super::framing;
use super::registry::{ConnectionId, Outbound, Transport};

pub(super) fn router(server: Server) -> Router {
    Router::new()
        .route("/ws", get(handle_ws))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(server)
}

pub(super) async fn serve(server: Server, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
    let app = router(server).into_make_service_with_connect_info::<SocketAddr>();
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await;
    if let Err(e) = result {
        warn!(error = %e, "server: websocket listener failed");
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn handle_ws(
    State(server): State<Server>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| run_ws(server, socket, peer))
}

async fn run_ws(server: Server, socket: WebSocket, peer: SocketAddr) {
    let mut shutdown = server.shutdown_signal();
    if *shutdown.borrow_and_update() {
        return;
    }

    let max_size = server.inner.config.max_message_size;
    let (sink, mut stream) = socket.split();
    let Registered { id, rx, closer } = register(&server, Some(peer), Transport::WebSocket);
    let writer = tokio::spawn(write_ws(server.clone(), id, sink, rx));

    let reason = loop {
        tokio::select! {
            () = closer.notified() => break "evicted",
            _ = shutdown.changed() => break "server shutdown",
            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    handle_decoded(&server, id, framing::decode_unit(text.as_str().as_bytes(), max_size)).await;
                }
                Some(Ok(WsMessage::Binary(bytes))) => {
                    handle_decoded(&server, id, framing::decode_unit(&bytes, max_size)).await;
                }
                Some(Ok(WsMessage::Close(_))) | None => break "peer closed",
                // Transport pings are answered by axum.
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(%id, error = %e, "server: websocket read failed");
                    break "read failed";
                }
            },
        }
    };

    teardown(&server, id, reason);
    writer.abort();
    let _ = writer.await;
}

async fn write_ws(
    server: Server,
    id: ConnectionId,
    mut sink: SplitSink<WebSocket, WsMessage>,
    mut rx: mpsc::Receiver<Outbound>,
) {
    while let Some(out) = rx.recv().await {
        let frame = match out {
            Outbound::Pong => WsMessage::Text("pong".into()),
            Outbound::Message(msg) => match msg.to_json() {
                Ok(text) => WsMessage::Text(text.into()),
                Err(e) => {
                    warn!(%id, error = %e, "server: failed to encode outbound message");
                    continue;
                }
            },
        };
        if let Err(e) = sink.send(frame).await {
            debug!(%id, error = %e, "server: websocket write failed");
            server.evict(id, "write failed");
            break;
        }
    }
    let _ = sink.close().await;
}
