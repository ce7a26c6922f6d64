//! Connection server: accepts peers, tracks them, and relays messages.
//!
//! DESIGN
//! ======
//! `Server` is a cheap `Arc` handle. All connection state lives in one
//! [`registry::Registry`] behind a single mutex; every public operation takes
//! the lock for bookkeeping only and releases it before any I/O. Each
//! connection owns a bounded outbound channel drained by its own writer task,
//! so unicast is a non-blocking `try_send`: a full or closed channel counts as
//! a failed send and evicts that peer without stalling anyone else.
//!
//! Two transports feed the same registry: raw TCP (see [`framing`]) and an
//! optional axum WebSocket endpoint.
//!
//! LIFECYCLE
//! =========
//! 1. `start()` binds, then spawns the accept loop(s), heartbeat push and
//!    timeout sweep.
//! 2. Each accepted peer gets a fresh id, a registry entry tagged `unknown`
//!    and a `welcome` message carrying the id.
//! 3. `stop()` flips the shutdown signal, evicts every peer and awaits every
//!    background task.

pub mod framing;
pub mod registry;

mod connection;
mod ws;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::dispatch::{HandlerRegistry, HandlerResult};
use crate::error::{RelayError, ServerError};
use crate::message::{Message, TYPE_QUESTION, TYPE_TASK_NEW};

pub use registry::{ConnectionId, ConnectionInfo, Transport};
use registry::{Outbound, Registry};

// =============================================================================
// CONTEXT
// =============================================================================

/// Handed to every server-side handler.
#[derive(Clone)]
pub struct ServerContext {
    pub server: Server,
    pub connection_id: ConnectionId,
}

impl ServerContext {
    /// Unicast back to the connection that sent the message.
    pub fn reply(&self, msg: Message) -> bool {
        self.server.send_to_client(self.connection_id, msg)
    }
}

// =============================================================================
// SERVER
// =============================================================================

#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

struct Inner {
    config: ServerConfig,
    registry: Mutex<Registry>,
    handlers: RwLock<HandlerRegistry<ServerContext>>,
    shutdown: watch::Sender<bool>,
    bound: Mutex<Bound>,
    lifecycle: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Default, Clone, Copy)]
struct Bound {
    tcp: Option<SocketAddr>,
    ws: Option<SocketAddr>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("tcp", &self.local_addr())
            .field("ws", &self.ws_local_addr())
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}

impl Server {
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown, _) = watch::channel(true);
        Self {
            inner: Arc::new(Inner {
                config,
                registry: Mutex::new(Registry::default()),
                handlers: RwLock::new(HandlerRegistry::new()),
                shutdown,
                bound: Mutex::new(Bound::default()),
                lifecycle: tokio::sync::Mutex::new(Vec::new()),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    // =========================================================================
    // HANDLERS
    // =========================================================================

    /// Register an async handler. Multiple handlers per type all run.
    pub fn register_handler<F, Fut>(&self, kind: impl Into<String>, handler: F)
    where
        F: Fn(ServerContext, Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let kind = kind.into();
        debug!(%kind, "server: register handler");
        self.handlers_mut().register_handler(kind, handler);
    }

    pub fn register_sync_handler<F>(&self, kind: impl Into<String>, handler: F)
    where
        F: Fn(ServerContext, &Message) -> HandlerResult + Send + Sync + 'static,
    {
        let kind = kind.into();
        debug!(%kind, "server: register handler");
        self.handlers_mut().register_sync_handler(kind, handler);
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Bind every configured listener and spawn the background loops.
    /// Calling it on a running server is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Config`] if the configuration is invalid and
    /// [`ServerError::Bind`] if a listener cannot be bound.
    pub async fn start(&self) -> Result<(), ServerError> {
        self.inner.config.validate()?;
        let mut tasks = self.inner.lifecycle.lock().await;
        if !tasks.is_empty() {
            debug!("server: start ignored, already running");
            return Ok(());
        }

        let config = &self.inner.config;
        let tcp_listener = bind(&config.tcp_addr()).await?;
        let tcp_addr = tcp_listener.local_addr()?;
        let ws_listener = match config.ws_addr() {
            Some(addr) => Some(bind(&addr).await?),
            None => None,
        };
        let ws_addr = ws_listener.as_ref().map(TcpListener::local_addr).transpose()?;

        *self.bound() = Bound { tcp: Some(tcp_addr), ws: ws_addr };
        self.inner.shutdown.send_replace(false);

        tasks.push(tokio::spawn(connection::accept_loop(self.clone(), tcp_listener, self.shutdown_signal())));
        if let Some(listener) = ws_listener {
            tasks.push(tokio::spawn(ws::serve(self.clone(), listener, self.shutdown_signal())));
        }
        tasks.push(tokio::spawn(heartbeat_loop(self.clone(), self.shutdown_signal())));
        tasks.push(tokio::spawn(sweep_loop(self.clone(), self.shutdown_signal())));

        info!(
            tcp = %tcp_addr,
            ws = ?ws_addr,
            framing = ?config.framing,
            heartbeat_secs = config.heartbeat_interval.as_secs_f64(),
            timeout_secs = config.connection_timeout.as_secs_f64(),
            "server: listening"
        );
        Ok(())
    }

    /// Signal shutdown, drop every connection and await every background
    /// task. Idempotent.
    pub async fn stop(&self) {
        let mut tasks = self.inner.lifecycle.lock().await;
        if tasks.is_empty() {
            return;
        }

        self.inner.shutdown.send_replace(true);
        let dropped = self.registry().drain();
        let count = dropped.len();
        for conn in dropped {
            conn.close();
        }

        for task in tasks.drain(..) {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "server: background task failed");
                }
            }
        }

        *self.bound() = Bound::default();
        info!(dropped = count, "server: stopped");
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        !*self.inner.shutdown.borrow()
    }

    /// Bound TCP address while running.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound().tcp
    }

    /// Bound WebSocket address while running, if enabled.
    #[must_use]
    pub fn ws_local_addr(&self) -> Option<SocketAddr> {
        self.bound().ws
    }

    // =========================================================================
    // SENDING
    // =========================================================================

    /// Unicast. A failed send evicts the target.
    pub fn send_to_client(&self, id: ConnectionId, msg: Message) -> bool {
        self.deliver(id, Outbound::Message(msg))
    }

    /// Send to every connection, or only those whose type tag equals
    /// `client_type`. Returns the number of successful sends; failed targets
    /// are evicted and never retried.
    pub fn broadcast(&self, msg: &Message, client_type: Option<&str>) -> usize {
        let targets = self.registry().targets(client_type);
        let total = targets.len();

        let mut delivered = 0;
        for (id, tx) in targets {
            match tx.try_send(Outbound::Message(msg.clone())) {
                Ok(()) => delivered += 1,
                Err(e) => self.evict(id, send_failure(&e)),
            }
        }

        debug!(kind = msg.kind().unwrap_or("-"), total, delivered, "server: broadcast");
        delivered
    }

    // =========================================================================
    // INTROSPECTION
    // =========================================================================

    #[must_use]
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.registry().snapshot(Instant::now())
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.registry().len()
    }

    // =========================================================================
    // INTERNALS
    // =========================================================================

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bound(&self) -> MutexGuard<'_, Bound> {
        self.inner.bound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handlers_mut(&self) -> std::sync::RwLockWriteGuard<'_, HandlerRegistry<ServerContext>> {
        self.inner.handlers.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.inner.shutdown.subscribe()
    }

    fn deliver(&self, id: ConnectionId, out: Outbound) -> bool {
        let Some(tx) = self.registry().sender(id) else {
            debug!(%id, "server: send to unknown connection");
            return false;
        };
        match tx.try_send(out) {
            Ok(()) => true,
            Err(e) => {
                self.evict(id, send_failure(&e));
                false
            }
        }
    }

    /// Remove a connection and stop its reader. No-op if already gone.
    fn evict(&self, id: ConnectionId, reason: &str) {
        let removed = self.registry().remove(id);
        if let Some(conn) = removed {
            info!(%id, type_tag = %conn.type_tag, transport = %conn.transport, reason, "server: connection evicted");
            conn.close();
        }
    }

    /// Route one classified inbound message.
    async fn handle_message(&self, id: ConnectionId, msg: Message) {
        match &msg {
            Message::Handshake { client_type, .. } => {
                if self.registry().set_type_tag(id, client_type, Instant::now()) {
                    info!(%id, %client_type, "server: handshake");
                    self.send_to_client(id, Message::connection_established(&id.to_string(), client_type));
                }
            }
            Message::Heartbeat { .. } => {
                self.send_to_client(id, Message::server_heartbeat());
            }
            Message::Untyped { .. } => {
                let err = RelayError::Protocol("message missing type field".into());
                warn!(%id, error = %err, "server: rejected message");
                self.send_to_client(id, Message::error_from(&err));
            }
            Message::Welcome { .. }
            | Message::ConnectionEstablished { .. }
            | Message::Error { .. }
            | Message::Custom { .. } => {
                let kind = msg.kind().unwrap_or_default();
                let target = if kind == TYPE_QUESTION { TYPE_TASK_NEW } else { kind };
                self.dispatch(id, kind, target, &msg).await;
            }
        }
    }

    async fn dispatch(&self, id: ConnectionId, kind: &str, target: &str, msg: &Message) {
        let handlers = self.inner.handlers.read().unwrap_or_else(PoisonError::into_inner).snapshot(target);
        if handlers.is_empty() {
            let err = if kind == target {
                RelayError::Protocol(format!("unknown message type: {kind}"))
            } else {
                RelayError::Protocol(format!("no handler registered for {target} ({kind})"))
            };
            warn!(%id, error = %err, "server: unhandled message");
            self.send_to_client(id, Message::error_from(&err));
            return;
        }

        let ctx = ServerContext { server: self.clone(), connection_id: id };
        let report = handlers.dispatch(target, ctx, msg).await;
        for failure in report.failures {
            self.send_to_client(id, Message::error_from(&RelayError::Handler(failure)));
        }
    }
}

// =============================================================================
// BACKGROUND LOOPS
// =============================================================================

async fn bind(addr: &str) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr: addr.to_owned(), source })
}

fn send_failure<T>(e: &tokio::sync::mpsc::error::TrySendError<T>) -> &'static str {
    match e {
        tokio::sync::mpsc::error::TrySendError::Full(_) => "outbound buffer full",
        tokio::sync::mpsc::error::TrySendError::Closed(_) => "connection closed",
    }
}

/// Push a heartbeat to every connection each interval.
async fn heartbeat_loop(server: Server, mut shutdown: watch::Receiver<bool>) {
    let period = server.inner.config.heartbeat_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let delivered = server.broadcast(&Message::server_heartbeat(), None);
                debug!(delivered, "server: heartbeat pushed");
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Evict connections idle for longer than `connection_timeout`.
async fn sweep_loop(server: Server, mut shutdown: watch::Receiver<bool>) {
    let period = server.inner.config.sweep_interval;
    let timeout = server.inner.config.connection_timeout;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let expired = server.registry().take_expired(Instant::now(), timeout);
                for conn in expired {
                    info!(id = %conn.id, type_tag = %conn.type_tag, "server: connection timed out");
                    conn.close();
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

#[cfg(test)]
#[path = "server_test.rs"]
mod tests;
