use super::*;
use std::sync::Mutex as StdMutex;

use serde_json::Value;
use tokio::net::TcpListener;

use crate::config::ServerConfig;
use crate::server::Server;

const WAIT: Duration = Duration::from_secs(5);

fn client_config(url: impl Into<String>) -> ClientConfig {
    ClientConfig {
        url: url.into(),
        client_type: "sim".into(),
        reconnect_interval: Duration::from_millis(50),
        reconnect_cap: Duration::from_millis(200),
        heartbeat_interval: Duration::from_secs(10),
        connection_timeout: Duration::from_secs(30),
        connect_timeout: Duration::from_secs(2),
        send_timeout: Duration::from_secs(2),
        close_timeout: Duration::from_secs(1),
        ping_interval: Duration::from_secs(30),
        ping_timeout: Duration::from_secs(5),
        liveness_check_interval: Duration::from_millis(50),
        flush_pacing: Duration::from_millis(100),
        reconnect_settle: Duration::from_millis(20),
        ..ClientConfig::default()
    }
}

fn server_config(ws_port: u16) -> ServerConfig {
    ServerConfig { host: "127.0.0.1".into(), port: 0, ws_port: Some(ws_port), ..ServerConfig::default() }
}

async fn ws_server() -> (Server, String) {
    let server = Server::new(server_config(0));
    server.start().await.unwrap();
    let url = format!("ws://{}/ws", server.ws_local_addr().unwrap());
    (server, url)
}

/// A URL nothing is listening on.
async fn dead_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("ws://{addr}/ws")
}

/// Accepts one WebSocket, optionally sends `greeting`, then never reads.
async fn silent_server(greeting: Option<WsMessage>) -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        if let Some(frame) = greeting {
            ws.send(frame).await.unwrap();
        }
        tokio::time::sleep(Duration::from_secs(60)).await;
        drop(ws);
    });
    (format!("ws://{addr}"), task)
}

async fn wait_for(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// =============================================================================
// CONNECTING
// =============================================================================

#[tokio::test]
async fn start_connects_and_learns_client_id() {
    let (server, url) = ws_server().await;
    let session = ClientSession::new(client_config(url));

    assert!(session.start().await);
    assert!(session.is_connected());

    wait_for(|| session.client_id().is_some()).await;
    wait_for(|| server.connections().iter().any(|c| c.type_tag == "sim")).await;

    let info = server.connections();
    assert_eq!(info.len(), 1);
    assert_eq!(Some(info[0].id.to_string()), session.client_id());

    let stats = session.stats();
    assert_eq!(stats.connection_attempts, 1);
    assert_eq!(stats.successful_connections, 1);

    session.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn concurrent_connects_collapse_into_one() {
    let (server, url) = ws_server().await;
    let session = ClientSession::new(client_config(url));

    let (a, b) = tokio::join!(session.connect(), session.connect());
    assert!(a && b);
    assert_eq!(session.stats().successful_connections, 1);

    session.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn failed_connect_reports_error_and_stays_disconnected() {
    let session = ClientSession::new(ClientConfig { auto_reconnect: false, ..client_config(dead_url().await) });

    let err = session.try_connect().await.unwrap_err();
    assert!(matches!(err, ClientError::WsConnect(_)), "unexpected error: {err}");
    assert_eq!(session.state(), ConnectionState::Disconnected);

    let stats = session.stats();
    assert_eq!(stats.connection_attempts, 1);
    assert_eq!(stats.errors, 1);
    assert!(stats.last_error.is_some());

    // Without auto-reconnect, start() makes one attempt and gives up.
    assert!(!session.start().await);
    assert!(!session.reconnect().await);
}

#[tokio::test]
async fn invalid_config_never_opens_a_transport() {
    let (server, url) = ws_server().await;
    let session = ClientSession::new(ClientConfig { liveness_check_interval: Duration::ZERO, ..client_config(url) });

    let err = session.try_connect().await.unwrap_err();
    assert!(matches!(err, ClientError::Config(_)), "unexpected error: {err}");
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert_eq!(session.stats().connection_attempts, 0);

    assert!(!session.start().await);
    assert!(!session.reconnect().await);
    assert!(session.lock_tasks().reconnect.is_empty());
    assert_eq!(server.connection_count(), 0);

    session.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn reconnect_gives_up_after_max_attempts() {
    let session = ClientSession::new(ClientConfig { max_reconnect_attempts: 2, ..client_config(dead_url().await) });

    assert!(!session.reconnect().await);

    let status = session.status();
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert_eq!(status.reconnect_attempts, 2);
    assert_eq!(status.stats.connection_attempts, 2);
    assert_eq!(status.stats.last_error.as_deref(), Some("gave up after 2 reconnect attempts"));

    // Out of attempts, a second run gives up without dialing.
    assert!(!session.reconnect().await);
    assert_eq!(session.stats().connection_attempts, 2);
}

// =============================================================================
// QUEUEING
// =============================================================================

#[tokio::test]
async fn queued_messages_flush_in_order_after_reconnect() {
    let (server, url) = ws_server().await;
    let seen: Arc<StdMutex<Vec<(u64, Instant)>>> = Arc::default();
    let sink = Arc::clone(&seen);
    server.register_sync_handler("order", move |_ctx, msg| {
        let n = msg.get("n").and_then(Value::as_u64).unwrap();
        sink.lock().unwrap().push((n, Instant::now()));
        Ok(())
    });

    let session = ClientSession::new(client_config(url));
    for n in 0..3 {
        assert!(!session.send(Message::new("order").with_data("n", n)).await);
    }
    assert_eq!(session.queue_len(), 3);

    wait_for(|| seen.lock().unwrap().len() == 3).await;
    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.iter().map(|(n, _)| *n).collect::<Vec<_>>(), vec![0, 1, 2]);
    for pair in seen.windows(2) {
        let gap = pair[1].1 - pair[0].1;
        assert!(gap >= Duration::from_millis(80), "messages not paced: {gap:?}");
    }

    assert_eq!(session.queue_len(), 0);
    assert!(session.is_connected());
    assert_eq!(session.stats().messages_queued, 3);

    session.stop().await;
    server.stop().await;
}

/// Records the `n` field of every `order` message the server receives.
fn record_order(server: &Server) -> Arc<StdMutex<Vec<u64>>> {
    let seen: Arc<StdMutex<Vec<u64>>> = Arc::default();
    let sink = Arc::clone(&seen);
    server.register_sync_handler("order", move |_ctx, msg| {
        sink.lock().unwrap().push(msg.get("n").and_then(Value::as_u64).unwrap());
        Ok(())
    });
    seen
}

/// Start `session` and wait until the handshake acknowledgment is handled.
async fn started_and_acknowledged(session: &ClientSession) {
    assert!(session.start().await);
    wait_for(|| session.stats().messages_received >= 2).await;
}

#[tokio::test]
async fn live_send_waits_behind_queued_messages() {
    let (server, url) = ws_server().await;
    let seen = record_order(&server);
    let session = ClientSession::new(client_config(url));
    started_and_acknowledged(&session).await;

    {
        let mut queue = session.lock_queue();
        for n in 0..2 {
            queue.push(Message::new("order").with_data("n", n)).unwrap();
        }
    }
    assert!(!session.send(Message::new("order").with_data("n", 2)).await);
    assert_eq!(session.stats().messages_queued, 1);

    wait_for(|| seen.lock().unwrap().len() == 3).await;
    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    assert_eq!(session.queue_len(), 0);

    session.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn failed_flush_send_goes_back_to_the_head() {
    let (server, url) = ws_server().await;
    let seen = record_order(&server);
    let session = ClientSession::new(client_config(url));
    started_and_acknowledged(&session).await;

    // Detach the transport so the next write fails.
    let detached = session.inner.sink.lock().await.take();
    assert!(detached.is_some());
    {
        let mut queue = session.lock_queue();
        for n in 0..3 {
            queue.push(Message::new("order").with_data("n", n)).unwrap();
        }
    }
    assert_eq!(session.flush_queue().await, 0);
    assert_eq!(session.queue_len(), 3);
    let head = session.lock_queue().pop_front().unwrap();
    assert_eq!(head.message.get("n").and_then(Value::as_u64), Some(0));
    assert!(session.lock_queue().requeue_front(head).is_none());

    *session.inner.sink.lock().await = detached;
    assert_eq!(session.flush_queue().await, 3);
    wait_for(|| seen.lock().unwrap().len() == 3).await;
    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);

    session.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn offline_queue_drops_past_capacity() {
    let session = ClientSession::new(ClientConfig {
        auto_reconnect: false,
        queue_capacity: 3,
        ..client_config(dead_url().await)
    });

    for n in 0..5 {
        assert!(!session.send(Message::new("tick").with_data("n", n)).await);
    }
    // Heartbeats are never queued.
    assert!(!session.send(Message::client_heartbeat(None)).await);

    assert_eq!(session.queue_len(), 3);
    let stats = session.stats();
    assert_eq!(stats.messages_queued, 3);
    assert_eq!(stats.messages_dropped, 2);
    assert_eq!(session.status().queue_capacity, 3);
}

#[tokio::test]
async fn oversized_message_is_rejected_not_queued() {
    let session = ClientSession::new(ClientConfig {
        auto_reconnect: false,
        max_message_size: 64,
        ..client_config(dead_url().await)
    });

    assert!(!session.send(Message::new("blob").with_data("data", "x".repeat(200))).await);
    assert_eq!(session.queue_len(), 0);
    let stats = session.stats();
    assert_eq!(stats.errors, 1);
    assert!(stats.last_error.unwrap().contains("exceeds max 64"));
}

// =============================================================================
// INBOUND
// =============================================================================

#[tokio::test]
async fn handlers_receive_server_broadcasts() {
    let (server, url) = ws_server().await;
    let session = ClientSession::new(client_config(url));
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    session.register_handler("tick", move |_session, msg| {
        let tx = tx.clone();
        async move {
            tx.send(msg.get("n").cloned()).unwrap();
            Ok(())
        }
    });

    assert!(session.start().await);
    wait_for(|| server.connections().iter().any(|c| c.type_tag == "sim")).await;

    assert_eq!(server.broadcast(&Message::new("tick").with_data("n", 7), Some("sim")), 1);
    let got = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(got, Some(Value::from(7)));
    assert!(session.stats().messages_received >= 3);

    session.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn server_error_replies_are_counted() {
    let (server, url) = ws_server().await;
    let session = ClientSession::new(client_config(url));
    assert!(session.start().await);

    assert!(session.send(Message::new("nobody_handles_this")).await);
    wait_for(|| session.stats().server_errors == 1).await;
    assert!(session.stats().last_error.unwrap().contains("unknown message type"));
    assert!(session.is_connected());

    session.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn failing_handler_is_counted_and_isolated() {
    let (server, url) = ws_server().await;
    let session = ClientSession::new(client_config(url));
    let calls = Arc::new(StdMutex::new(0));
    session.register_sync_handler("tick", |_session, _msg| Err("bad tick".into()));
    let counter = Arc::clone(&calls);
    session.register_sync_handler("tick", move |_session, _msg| {
        *counter.lock().unwrap() += 1;
        Ok(())
    });

    assert!(session.start().await);
    wait_for(|| server.connections().iter().any(|c| c.type_tag == "sim")).await;
    server.broadcast(&Message::new("tick"), None);

    wait_for(|| *calls.lock().unwrap() == 1).await;
    wait_for(|| session.stats().handler_errors == 1).await;
    assert_eq!(session.stats().last_error.as_deref(), Some("bad tick"));

    session.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn unparseable_frames_go_to_raw_handlers() {
    let (url, acceptor) = silent_server(Some(WsMessage::text("definitely not json"))).await;
    let session = ClientSession::new(ClientConfig { auto_reconnect: false, ..client_config(url) });
    let raw: Arc<StdMutex<Vec<Vec<u8>>>> = Arc::default();
    let sink = Arc::clone(&raw);
    session.register_raw_handler(move |bytes| {
        sink.lock().unwrap().push(bytes.to_vec());
        Ok(())
    });

    assert!(session.start().await);
    wait_for(|| !raw.lock().unwrap().is_empty()).await;
    assert_eq!(raw.lock().unwrap()[0], b"definitely not json");
    assert!(session.is_connected());

    session.stop().await;
    acceptor.abort();
}

#[tokio::test]
async fn invalid_utf8_binary_reaches_async_raw_handler_unchanged() {
    let frame = vec![0xff, 0xfe, b'{', 0x80];
    let (url, acceptor) = silent_server(Some(WsMessage::binary(frame.clone()))).await;
    let session = ClientSession::new(ClientConfig { auto_reconnect: false, ..client_config(url) });
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    session.register_async_raw_handler(move |bytes| {
        let tx = tx.clone();
        async move {
            tx.send(bytes).unwrap();
            Ok(())
        }
    });
    session.register_raw_handler(|_bytes| Err("cannot decode".into()));

    assert!(session.start().await);
    let got = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(got, frame);
    wait_for(|| session.stats().handler_errors == 1).await;
    assert_eq!(session.stats().last_error.as_deref(), Some("cannot decode"));
    assert!(session.is_connected());

    session.stop().await;
    acceptor.abort();
}

// =============================================================================
// LIVENESS
// =============================================================================

#[tokio::test]
async fn silent_server_trips_connection_timeout() {
    let (url, acceptor) = silent_server(None).await;
    let session = ClientSession::new(ClientConfig {
        auto_reconnect: false,
        connection_timeout: Duration::from_millis(300),
        ..client_config(url)
    });

    assert!(session.start().await);
    wait_for(|| session.state() == ConnectionState::Disconnected).await;

    let stats = session.stats();
    assert_eq!(stats.disconnections, 1);
    assert!(stats.last_error.unwrap().contains("liveness timeout"));
    assert!(stats.total_uptime > Duration::ZERO);

    session.stop().await;
    acceptor.abort();
}

#[tokio::test]
async fn unanswered_ping_drops_the_connection() {
    let (url, acceptor) = silent_server(None).await;
    let session = ClientSession::new(ClientConfig {
        auto_reconnect: false,
        ping_interval: Duration::from_millis(100),
        ping_timeout: Duration::from_millis(200),
        ..client_config(url)
    });

    assert!(session.start().await);
    wait_for(|| session.state() == ConnectionState::Disconnected).await;
    assert_eq!(session.stats().last_error.as_deref(), Some("liveness timeout after 200ms"));

    session.stop().await;
    acceptor.abort();
}

#[tokio::test]
async fn stalled_heartbeat_sender_is_restarted_not_dropped() {
    let (server, url) = ws_server().await;
    let session = ClientSession::new(ClientConfig { heartbeat_interval: Duration::from_millis(100), ..client_config(url) });
    assert!(session.start().await);

    let stalled = session.lock_tasks().heartbeat.take().unwrap();
    stalled.abort();
    let sent = session.stats().messages_sent;

    wait_for(|| session.stats().messages_sent >= sent + 2).await;
    assert!(session.is_connected());
    assert!(session.lock_tasks().heartbeat.is_some());
    assert_eq!(session.stats().disconnections, 0);

    session.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn stale_epoch_loss_is_ignored() {
    let (server, url) = ws_server().await;
    let session = ClientSession::new(client_config(url));
    assert!(session.start().await);

    let epoch = session.lock_state().epoch;
    session.connection_lost(epoch + 1, &RelayError::Transport("old link".into()));
    assert!(session.is_connected());
    assert_eq!(session.stats().disconnections, 0);

    session.stop().await;
    server.stop().await;
}

#[tokio::test]
async fn reconnects_after_server_restart() {
    let (server, url) = ws_server().await;
    let port = server.ws_local_addr().unwrap().port();
    let session = ClientSession::new(client_config(url));
    assert!(session.start().await);
    wait_for(|| session.client_id().is_some()).await;
    let first_id = session.client_id();

    server.stop().await;
    wait_for(|| !session.is_connected()).await;

    let restarted = Server::new(server_config(port));
    restarted.start().await.unwrap();
    wait_for(|| session.is_connected()).await;
    wait_for(|| session.client_id() != first_id).await;

    let stats = session.stats();
    assert_eq!(stats.successful_connections, 2);
    assert_eq!(stats.disconnections, 1);
    assert_eq!(session.status().reconnect_attempts, 0);

    session.stop().await;
    restarted.stop().await;
}

// =============================================================================
// STOP / STATUS
// =============================================================================

#[tokio::test]
async fn stop_is_terminal_and_idempotent() {
    let session = ClientSession::new(client_config(dead_url().await));
    assert!(!session.start().await);

    session.stop().await;
    session.stop().await;

    assert_eq!(session.state(), ConnectionState::Stopped);
    assert!(!session.send(Message::new("late")).await);
    assert_eq!(session.queue_len(), 0);
    assert!(!session.connect().await);
    assert!(matches!(session.try_connect().await, Err(ClientError::Stopped)));
    assert!(!session.reconnect().await);
}

#[tokio::test]
async fn status_snapshot_reflects_live_connection() {
    let (server, url) = ws_server().await;
    let session = ClientSession::new(client_config(url.clone()));
    assert!(session.start().await);

    let status = session.status();
    assert_eq!(status.state, ConnectionState::Connected);
    assert_eq!(status.url, url);
    assert_eq!(status.client_type, "sim");
    assert!(status.uptime_secs.is_some());
    assert_eq!(status.queue_capacity, 100);

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["state"], "connected");
    assert_eq!(json["stats"]["successful_connections"], 1);

    session.stop().await;
    assert_eq!(session.status().uptime_secs, None);
    server.stop().await;
}
