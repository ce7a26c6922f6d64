//! Resilient client session: a WebSocket link that heals itself.
//!
//! DESIGN
//! ======
//! `ClientSession` is a cheap `Arc` handle; every clone drives the same
//! session. Short-lived bookkeeping (state, queue, stats) sits behind std
//! mutexes that are never held across an await. The transport sink lives in
//! an async mutex tagged with the connection epoch, so a background task
//! from a replaced connection can never close or write to its successor.
//!
//! LIFECYCLE
//! =========
//! `Disconnected → Connecting → Connected → Disconnected → Reconnecting → …`
//! with `Stopped` reachable from anywhere and terminal.
//!
//! - `connect()` is serialized by a mutex; on success it handshakes, bumps
//!   the epoch and spawns three per-connection loops: heartbeat sender,
//!   liveness checker, inbound listener.
//! - Any loop that detects a dead link calls `connection_lost(epoch)`, which
//!   is a no-op for stale epochs. It cancels the loops, closes the transport
//!   in the background and schedules the reconnect driver.
//! - The reconnect driver is single-flight (atomic flag). It sleeps with
//!   capped exponential backoff plus jitter, reconnects, then flushes the
//!   outbound queue in FIFO order with pacing.
//! - `stop()` marks the session stopped, cancels and awaits every task, then
//!   closes the transport under `close_timeout`.

pub mod backoff;
pub mod queue;
pub mod stats;

mod inbound;
mod liveness;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::dispatch::{HandlerFuture, HandlerRegistry, HandlerResult};
use crate::error::{ClientError, RelayError};
use crate::message::Message;

use backoff::ReconnectPolicy;
use queue::OutboundQueue;
pub use stats::{ConnectionState, Stats, StatusSnapshot};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;
type WsSource = SplitStream<WsStream>;

/// Fallback for inbound frames that do not decode as a JSON message. It gets
/// the frame's bytes as received, which may not be valid UTF-8.
pub type RawHandler = Arc<dyn Fn(Vec<u8>) -> HandlerFuture + Send + Sync>;

// =============================================================================
// STATE
// =============================================================================

struct SessionState {
    state: ConnectionState,
    /// Bumped on every successful connect.
    epoch: u64,
    client_id: Option<String>,
    attempts: u32,
    last_received: Instant,
    last_heartbeat_sent: Instant,
    connected_at: Option<Instant>,
}

#[derive(Default)]
struct Tasks {
    heartbeat: Option<JoinHandle<()>>,
    liveness: Option<JoinHandle<()>>,
    listener: Option<JoinHandle<()>>,
    flush: Vec<JoinHandle<()>>,
    reconnect: Vec<JoinHandle<()>>,
}

impl Tasks {
    fn take_all(&mut self) -> Vec<JoinHandle<()>> {
        let mut all: Vec<JoinHandle<()>> = [self.heartbeat.take(), self.liveness.take(), self.listener.take()]
            .into_iter()
            .flatten()
            .collect();
        all.append(&mut self.flush);
        all.append(&mut self.reconnect);
        all
    }
}

struct Inner {
    config: ClientConfig,
    policy: ReconnectPolicy,
    state: Mutex<SessionState>,
    queue: Mutex<OutboundQueue>,
    stats: Mutex<Stats>,
    handlers: RwLock<HandlerRegistry<ClientSession>>,
    raw_handlers: RwLock<Vec<RawHandler>>,
    sink: tokio::sync::Mutex<Option<(u64, WsSink)>>,
    connect_lock: tokio::sync::Mutex<()>,
    reconnecting: AtomicBool,
    flushing: AtomicBool,
    pending_pong: Mutex<Option<oneshot::Sender<()>>>,
    tasks: Mutex<Tasks>,
}

/// Holds an atomic flag for the guard's lifetime.
struct FlagGuard<'a>(&'a AtomicBool);

impl<'a> FlagGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// =============================================================================
// SESSION
// =============================================================================

#[derive(Clone)]
pub struct ClientSession {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("url", &self.inner.config.url)
            .field("state", &self.state())
            .field("queued", &self.queue_len())
            .finish_non_exhaustive()
    }
}

impl ClientSession {
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        let now = Instant::now();
        Self {
            inner: Arc::new(Inner {
                policy: ReconnectPolicy::from_config(&config),
                queue: Mutex::new(OutboundQueue::new(config.queue_capacity)),
                config,
                state: Mutex::new(SessionState {
                    state: ConnectionState::Disconnected,
                    epoch: 0,
                    client_id: None,
                    attempts: 0,
                    last_received: now,
                    last_heartbeat_sent: now,
                    connected_at: None,
                }),
                stats: Mutex::new(Stats::default()),
                handlers: RwLock::new(HandlerRegistry::new()),
                raw_handlers: RwLock::new(Vec::new()),
                sink: tokio::sync::Mutex::new(None),
                connect_lock: tokio::sync::Mutex::new(()),
                reconnecting: AtomicBool::new(false),
                flushing: AtomicBool::new(false),
                pending_pong: Mutex::new(None),
                tasks: Mutex::new(Tasks::default()),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    // =========================================================================
    // HANDLERS
    // =========================================================================

    /// Register an async handler for inbound messages of `kind`.
    pub fn register_handler<F, Fut>(&self, kind: impl Into<String>, handler: F)
    where
        F: Fn(ClientSession, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register_handler(kind, handler);
    }

    pub fn register_sync_handler<F>(&self, kind: impl Into<String>, handler: F)
    where
        F: Fn(ClientSession, &Message) -> HandlerResult + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register_sync_handler(kind, handler);
    }

    /// Register a fallback for frames that do not parse as a JSON object.
    pub fn register_raw_handler<F>(&self, handler: F)
    where
        F: Fn(&[u8]) -> HandlerResult + Send + Sync + 'static,
    {
        self.push_raw_handler(Arc::new(move |raw: Vec<u8>| -> HandlerFuture {
            Box::pin(std::future::ready(handler(&raw)))
        }));
    }

    pub fn register_async_raw_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.push_raw_handler(Arc::new(move |raw: Vec<u8>| -> HandlerFuture { Box::pin(handler(raw)) }));
    }

    fn push_raw_handler(&self, handler: RawHandler) {
        self.inner
            .raw_handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Connect, or hand off to the reconnect driver if that fails.
    pub async fn start(&self) -> bool {
        if let Err(e) = self.inner.config.validate() {
            error!(error = %e, "client: not starting");
            self.lock_stats().record_error(&e);
            return false;
        }
        if self.connect().await {
            return true;
        }
        self.schedule_reconnect();
        false
    }

    /// Single connection attempt. Returns true if connected afterwards.
    pub async fn connect(&self) -> bool {
        self.try_connect().await.is_ok()
    }

    /// Single connection attempt with the failure reason.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Stopped`] after `stop()`,
    /// [`ClientError::Config`] for an invalid configuration, and a transport
    /// or handshake error if the attempt fails.
    pub async fn try_connect(&self) -> Result<(), ClientError> {
        let _serial = self.inner.connect_lock.lock().await;

        let current = self.lock_state().state;
        match current {
            ConnectionState::Stopped => return Err(ClientError::Stopped),
            ConnectionState::Connected => return Ok(()),
            _ => {}
        }
        if let Err(e) = self.inner.config.validate() {
            return Err(self.connect_failed(e.into()));
        }
        self.set_state_unless_stopped(ConnectionState::Connecting);
        self.lock_stats().connection_attempts += 1;

        let stream = match self.open_transport().await {
            Ok(stream) => stream,
            Err(e) => return Err(self.connect_failed(e)),
        };
        let (mut sink, source) = stream.split();

        if let Err(e) = self.send_handshake(&mut sink).await {
            close_sink(sink, self.inner.config.close_timeout).await;
            return Err(self.connect_failed(e));
        }

        let mut slot = self.inner.sink.lock().await;
        let Some(epoch) = self.commit_connected() else {
            drop(slot);
            close_sink(sink, self.inner.config.close_timeout).await;
            return Err(ClientError::Stopped);
        };
        *slot = Some((epoch, sink));
        drop(slot);

        {
            let mut stats = self.lock_stats();
            stats.successful_connections += 1;
            stats.messages_sent += 1;
        }
        self.spawn_connection_tasks(epoch, source);
        info!(url = %self.inner.config.url, client_type = %self.inner.config.client_type, epoch, "client: connected");
        Ok(())
    }

    /// Run the guarded reconnect sequence until connected, stopped, disabled
    /// or out of attempts. Returns false immediately if a sequence is
    /// already running.
    pub async fn reconnect(&self) -> bool {
        if !self.inner.config.auto_reconnect {
            debug!("client: auto-reconnect disabled");
            return false;
        }
        if let Err(e) = self.inner.config.validate() {
            error!(error = %e, "client: reconnect refused");
            return false;
        }

        loop {
            let Some(guard) = FlagGuard::acquire(&self.inner.reconnecting) else {
                debug!("client: reconnect already in progress");
                return false;
            };
            let connected = self.reconnect_sequence().await;
            drop(guard);

            // A loss reported while the flag was held could not schedule a
            // new sequence, so pick it up here.
            if !connected || self.state() != ConnectionState::Disconnected {
                return connected && self.is_connected();
            }
        }
    }

    async fn reconnect_sequence(&self) -> bool {
        let config = &self.inner.config;
        loop {
            let (state, attempts) = {
                let state = self.lock_state();
                (state.state, state.attempts)
            };
            match state {
                ConnectionState::Stopped => return false,
                ConnectionState::Connected => return true,
                _ => {}
            }
            if attempts >= config.max_reconnect_attempts {
                error!(attempts, url = %config.url, "client: reconnect attempts exhausted");
                self.lock_stats().record_error(format!("gave up after {attempts} reconnect attempts"));
                return false;
            }

            let attempt = attempts + 1;
            let delay = self.inner.policy.delay(attempt);
            self.set_state_unless_stopped(ConnectionState::Reconnecting);
            info!(
                attempt,
                max = config.max_reconnect_attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "client: reconnecting"
            );
            tokio::time::sleep(delay).await;

            {
                let mut state = self.lock_state();
                if state.state == ConnectionState::Stopped {
                    return false;
                }
                state.attempts = attempt;
            }

            if self.connect().await {
                tokio::time::sleep(config.reconnect_settle).await;
                self.flush_queue().await;
            }
        }
    }

    /// Cancel every background task, close the transport and mark the
    /// session stopped. Idempotent.
    pub async fn stop(&self) {
        let uptime = {
            let mut state = self.lock_state();
            if state.state == ConnectionState::Stopped {
                return;
            }
            state.state = ConnectionState::Stopped;
            state.connected_at.take().map(|at| at.elapsed())
        };
        self.lock_stats().total_uptime += uptime.unwrap_or_default();

        let current = tokio::task::try_id();
        let handles: Vec<JoinHandle<()>> = self
            .lock_tasks()
            .take_all()
            .into_iter()
            .filter(|handle| Some(handle.id()) != current)
            .collect();
        for handle in &handles {
            handle.abort();
        }
        for handle in handles {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "client: background task failed");
                }
            }
        }

        self.lock_pending_pong().take();
        let sink = self.inner.sink.lock().await.take();
        if let Some((_, sink)) = sink {
            close_sink(sink, self.inner.config.close_timeout).await;
        }

        let stats = self.stats();
        info!(
            sent = stats.messages_sent,
            received = stats.messages_received,
            queued = self.queue_len(),
            "client: stopped"
        );
    }

    // =========================================================================
    // SENDING
    // =========================================================================

    /// Send a message. Returns true only if it was written to a live
    /// transport now.
    ///
    /// While disconnected, non-heartbeat messages are queued (dropped with a
    /// warning once the queue is full) and a reconnect is scheduled. While
    /// earlier messages are still queued, new ones wait behind them.
    /// Oversized messages are rejected outright.
    pub async fn send(&self, msg: Message) -> bool {
        let text = match self.encode(&msg) {
            Ok(text) => text,
            Err(e) => {
                warn!(kind = msg.kind().unwrap_or("-"), error = %e, "client: message rejected");
                self.lock_stats().record_error(&e);
                return false;
            }
        };

        let state = self.state();
        match state {
            ConnectionState::Stopped => {
                debug!(kind = msg.kind().unwrap_or("-"), "client: send after stop ignored");
                false
            }
            ConnectionState::Connected => {
                let heartbeat = msg.is_heartbeat();
                if !heartbeat && (self.inner.flushing.load(Ordering::SeqCst) || !self.lock_queue().is_empty()) {
                    self.enqueue(msg);
                    self.spawn_flush();
                    return false;
                }
                self.transmit(text, heartbeat).await.is_ok()
            }
            ConnectionState::Disconnected | ConnectionState::Connecting | ConnectionState::Reconnecting => {
                debug!(kind = msg.kind().unwrap_or("-"), %state, "client: not connected");
                self.enqueue(msg);
                self.schedule_reconnect();
                false
            }
        }
    }

    /// Send every queued message in FIFO order with pacing. A failed send
    /// puts the message back at the head and stops the flush. Returns how
    /// many messages went out.
    pub async fn flush_queue(&self) -> usize {
        let mut total = 0;
        loop {
            let Some(guard) = FlagGuard::acquire(&self.inner.flushing) else {
                return total;
            };
            let (sent, clean) = self.drain_queue().await;
            drop(guard);
            total += sent;

            // Producers that saw the flag set queued behind it; re-check.
            if !clean || !self.is_connected() || self.lock_queue().is_empty() {
                break;
            }
        }
        if total > 0 {
            info!(sent = total, remaining = self.queue_len(), "client: outbound queue flushed");
        }
        total
    }

    async fn drain_queue(&self) -> (usize, bool) {
        let pacing = self.inner.config.flush_pacing;
        let mut sent = 0;
        loop {
            if sent > 0 {
                tokio::time::sleep(pacing).await;
            }
            if !self.is_connected() {
                return (sent, false);
            }
            let Some(entry) = self.lock_queue().pop_front() else {
                return (sent, true);
            };

            let text = match self.encode(&entry.message) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "client: queued message dropped");
                    continue;
                }
            };
            let heartbeat = entry.message.is_heartbeat();
            match self.transmit(text, heartbeat).await {
                Ok(()) => {
                    sent += 1;
                    debug!(
                        kind = entry.message.kind().unwrap_or("-"),
                        waited_ms = u64::try_from(entry.enqueued_at.elapsed().as_millis()).unwrap_or(u64::MAX),
                        "client: queued message sent"
                    );
                }
                Err(e) => {
                    let evicted = self.lock_queue().requeue_front(entry);
                    if let Some(evicted) = evicted {
                        warn!(kind = evicted.message.kind().unwrap_or("-"), "client: queue full on requeue, oldest dropped");
                        self.lock_stats().messages_dropped += 1;
                    }
                    warn!(error = %e, sent, "client: flush interrupted");
                    return (sent, false);
                }
            }
        }
    }

    // =========================================================================
    // STATUS
    // =========================================================================

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.lock_state().state
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Id assigned by the server in its welcome / acknowledgment.
    #[must_use]
    pub fn client_id(&self) -> Option<String> {
        self.lock_state().client_id.clone()
    }

    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.lock_queue().len()
    }

    #[must_use]
    pub fn stats(&self) -> Stats {
        self.lock_stats().clone()
    }

    #[must_use]
    pub fn status(&self) -> StatusSnapshot {
        let (state, client_id, attempts, uptime) = {
            let state = self.lock_state();
            (state.state, state.client_id.clone(), state.attempts, state.connected_at.map(|at| at.elapsed()))
        };
        let (queue_len, queue_capacity) = {
            let queue = self.lock_queue();
            (queue.len(), queue.capacity())
        };
        let stats = self.stats();
        let config = &self.inner.config;

        StatusSnapshot {
            state,
            url: config.url.clone(),
            client_type: config.client_type.clone(),
            client_id,
            reconnect_attempts: attempts,
            max_reconnect_attempts: config.max_reconnect_attempts,
            queue_len,
            queue_capacity,
            uptime_secs: uptime.map(|d| d.as_secs_f64()),
            total_uptime_secs: (stats.total_uptime + uptime.unwrap_or_default()).as_secs_f64(),
            stats,
        }
    }

    // =========================================================================
    // INTERNALS
    // =========================================================================

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_queue(&self) -> MutexGuard<'_, OutboundQueue> {
        self.inner.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_stats(&self) -> MutexGuard<'_, Stats> {
        self.inner.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Tasks> {
        self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_pending_pong(&self) -> MutexGuard<'_, Option<oneshot::Sender<()>>> {
        self.inner.pending_pong.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state_unless_stopped(&self, next: ConnectionState) {
        let mut state = self.lock_state();
        if state.state != ConnectionState::Stopped {
            state.state = next;
        }
    }

    /// Whether `epoch` is still the live connection.
    fn is_current(&self, epoch: u64) -> bool {
        let state = self.lock_state();
        state.epoch == epoch && state.state == ConnectionState::Connected
    }

    async fn open_transport(&self) -> Result<WsStream, ClientError> {
        let config = &self.inner.config;
        match tokio::time::timeout(config.connect_timeout, connect_async(config.url.as_str())).await {
            Err(_) => Err(ClientError::ConnectTimeout { url: config.url.clone(), timeout: config.connect_timeout }),
            Ok(Err(e)) => Err(ClientError::WsConnect(Box::new(e))),
            Ok(Ok((stream, _response))) => Ok(stream),
        }
    }

    async fn send_handshake(&self, sink: &mut WsSink) -> Result<(), ClientError> {
        let config = &self.inner.config;
        let text = Message::handshake(&config.client_type)
            .to_json()
            .map_err(|e| ClientError::Handshake(RelayError::Framing(e.to_string())))?;
        match tokio::time::timeout(config.send_timeout, sink.send(WsMessage::text(text))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ClientError::Handshake(RelayError::Transport(e.to_string()))),
            Err(_) => Err(ClientError::Handshake(RelayError::Transport(format!(
                "handshake send timed out after {:?}",
                config.send_timeout
            )))),
        }
    }

    /// Flip to `Connected` under a new epoch unless stopped meanwhile.
    fn commit_connected(&self) -> Option<u64> {
        let now = Instant::now();
        let mut state = self.lock_state();
        if state.state == ConnectionState::Stopped {
            return None;
        }
        state.epoch += 1;
        state.state = ConnectionState::Connected;
        state.attempts = 0;
        state.last_received = now;
        state.last_heartbeat_sent = now;
        state.connected_at = Some(now);
        Some(state.epoch)
    }

    fn connect_failed(&self, err: ClientError) -> ClientError {
        self.set_state_unless_stopped(ConnectionState::Disconnected);
        self.lock_stats().record_error(&err);
        warn!(url = %self.inner.config.url, error = %err, "client: connect failed");
        err
    }

    fn spawn_connection_tasks(&self, epoch: u64, source: WsSource) {
        let listener = tokio::spawn(self.clone().listen(epoch, source));
        let heartbeat = tokio::spawn(self.clone().heartbeat_loop(epoch));
        let liveness = tokio::spawn(self.clone().liveness_loop(epoch));

        let mut tasks = self.lock_tasks();
        let stale = [tasks.listener.replace(listener), tasks.heartbeat.replace(heartbeat), tasks.liveness.replace(liveness)];
        for handle in stale.into_iter().flatten() {
            handle.abort();
        }
    }

    fn encode(&self, msg: &Message) -> Result<String, RelayError> {
        let text = msg.to_json().map_err(|e| RelayError::Framing(format!("failed to encode message: {e}")))?;
        let max = self.inner.config.max_message_size;
        if text.len() > max {
            return Err(RelayError::Framing(format!("message of {} bytes exceeds max {max}", text.len())));
        }
        Ok(text)
    }

    fn enqueue(&self, msg: Message) {
        if msg.is_heartbeat() {
            return;
        }
        let kind = msg.kind().unwrap_or("-").to_owned();
        let pushed = self.lock_queue().push(msg);
        match pushed {
            Ok(()) => {
                self.lock_stats().messages_queued += 1;
                debug!(%kind, queued = self.queue_len(), "client: message queued");
            }
            Err(e) => {
                warn!(%kind, error = %e, "client: outbound queue full, message dropped");
                let mut stats = self.lock_stats();
                stats.messages_dropped += 1;
                stats.record_error(&e);
            }
        }
    }

    /// Write one encoded message under `send_timeout`. A transport failure
    /// is reported as a lost connection.
    async fn transmit(&self, text: String, heartbeat: bool) -> Result<(), RelayError> {
        let send_timeout = self.inner.config.send_timeout;
        let mut slot = self.inner.sink.lock().await;
        let Some((epoch, sink)) = slot.as_mut() else {
            return Err(RelayError::Transport("not connected".into()));
        };
        let epoch = *epoch;
        let result = tokio::time::timeout(send_timeout, sink.send(WsMessage::text(text))).await;
        drop(slot);

        let err = match result {
            Ok(Ok(())) => {
                self.lock_stats().messages_sent += 1;
                if heartbeat {
                    self.lock_state().last_heartbeat_sent = Instant::now();
                }
                return Ok(());
            }
            Ok(Err(e)) => RelayError::Transport(format!("send failed: {e}")),
            Err(_) => RelayError::Transport(format!("send timed out after {send_timeout:?}")),
        };
        self.connection_lost(epoch, &err);
        Err(err)
    }

    pub(crate) fn spawn_flush(&self) {
        if self.lock_queue().is_empty() {
            return;
        }
        let session = self.clone();
        let handle = tokio::spawn(async move {
            session.flush_queue().await;
        });
        let mut tasks = self.lock_tasks();
        tasks.flush.retain(|h| !h.is_finished());
        tasks.flush.push(handle);
    }

    fn schedule_reconnect(&self) {
        if !self.inner.config.auto_reconnect || self.inner.reconnecting.load(Ordering::SeqCst) {
            return;
        }
        if self.state() == ConnectionState::Stopped {
            return;
        }
        let session = self.clone();
        let handle = tokio::spawn(async move {
            session.reconnect().await;
        });
        let mut tasks = self.lock_tasks();
        tasks.reconnect.retain(|h| !h.is_finished());
        tasks.reconnect.push(handle);
    }

    /// Tear down the connection identified by `epoch`. No-op if that
    /// connection is already gone.
    fn connection_lost(&self, epoch: u64, reason: &RelayError) {
        let uptime = {
            let mut state = self.lock_state();
            if state.epoch != epoch || state.state != ConnectionState::Connected {
                return;
            }
            state.state = ConnectionState::Disconnected;
            state.connected_at.take().map(|at| at.elapsed())
        };
        {
            let mut stats = self.lock_stats();
            stats.disconnections += 1;
            stats.total_uptime += uptime.unwrap_or_default();
            stats.record_error(reason);
        }
        warn!(epoch, error = %reason, "client: connection lost");

        self.abort_connection_tasks();
        self.lock_pending_pong().take();

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let stale = {
                let mut slot = inner.sink.lock().await;
                let ours = slot.as_ref().is_some_and(|(current, _)| *current == epoch);
                if ours { slot.take() } else { None }
            };
            if let Some((_, sink)) = stale {
                close_sink(sink, inner.config.close_timeout).await;
            }
        });

        self.schedule_reconnect();
    }

    /// Abort the per-connection loops, except the caller's own task.
    fn abort_connection_tasks(&self) {
        let handles = {
            let mut tasks = self.lock_tasks();
            [tasks.heartbeat.take(), tasks.liveness.take(), tasks.listener.take()]
        };
        let current = tokio::task::try_id();
        for handle in handles.into_iter().flatten() {
            if Some(handle.id()) != current {
                handle.abort();
            }
        }
    }
}

async fn close_sink(mut sink: WsSink, timeout: Duration) {
    match tokio::time::timeout(timeout, sink.close()).await {
        Ok(Ok(())) => debug!("client: transport closed"),
        Ok(Err(e)) => debug!(error = %e, "client: transport close failed"),
        Err(_) => warn!(?timeout, "client: transport close timed out"),
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
