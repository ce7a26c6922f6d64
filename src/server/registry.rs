//! Connection registry: the authoritative set of live peers.
//!
//! DESIGN
//! ======
//! One `Registry` per server, always behind a single mutex. Every method is
//! pure bookkeeping: callers copy out what they need (usually a sender
//! clone), drop the lock, and only then touch the network. Removing an entry
//! drops its outbound sender (the writer task drains and exits) and notifies
//! the connection's reader so it stops.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use uuid::Uuid;

use crate::message::Message;

/// Type tag of a connection that has not handshaken yet.
pub const UNKNOWN_TYPE: &str = "unknown";

// =============================================================================
// IDS
// =============================================================================

/// Opaque connection id, rendered as a UUID string on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for ConnectionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

// =============================================================================
// CONNECTION
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    WebSocket,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Tcp => "tcp",
            Self::WebSocket => "websocket",
        })
    }
}

/// Item queued for a connection's writer task.
#[derive(Debug, Clone)]
pub(crate) enum Outbound {
    Message(Message),
    /// Raw probe reply, encoded per transport.
    Pong,
}

pub(crate) struct ClientConnection {
    pub id: ConnectionId,
    pub tx: mpsc::Sender<Outbound>,
    pub type_tag: String,
    pub last_seen: Instant,
    pub connected_at: Instant,
    pub peer: Option<SocketAddr>,
    pub transport: Transport,
    closer: Arc<Notify>,
}

impl ClientConnection {
    pub fn new(
        id: ConnectionId,
        tx: mpsc::Sender<Outbound>,
        peer: Option<SocketAddr>,
        transport: Transport,
        closer: Arc<Notify>,
    ) -> Self {
        let now = Instant::now();
        Self { id, tx, type_tag: UNKNOWN_TYPE.to_owned(), last_seen: now, connected_at: now, peer, transport, closer }
    }

    /// Tell the reader to stop. The sender is dropped with `self`.
    pub fn close(self) {
        // `notify_one` stores a permit, so a reader that is not parked yet
        // still observes it.
        self.closer.notify_one();
    }

    fn info(&self, now: Instant) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            type_tag: self.type_tag.clone(),
            peer: self.peer,
            transport: self.transport,
            idle_secs: now.saturating_duration_since(self.last_seen).as_secs_f64(),
            connected_secs: now.saturating_duration_since(self.connected_at).as_secs_f64(),
        }
    }
}

/// Point-in-time view of one connection, for collaborators and logs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub type_tag: String,
    pub peer: Option<SocketAddr>,
    pub transport: Transport,
    pub idle_secs: f64,
    pub connected_secs: f64,
}

// =============================================================================
// REGISTRY
// =============================================================================

#[derive(Default)]
pub(crate) struct Registry {
    conns: HashMap<ConnectionId, ClientConnection>,
}

impl Registry {
    /// Insert a connection. Returns false (and leaves the map untouched) if
    /// the id is already registered.
    pub fn insert(&mut self, conn: ClientConnection) -> bool {
        if self.conns.contains_key(&conn.id) {
            return false;
        }
        self.conns.insert(conn.id, conn);
        true
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<ClientConnection> {
        self.conns.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    /// Record inbound activity.
    pub fn touch(&mut self, id: ConnectionId, now: Instant) -> bool {
        let Some(conn) = self.conns.get_mut(&id) else {
            return false;
        };
        conn.last_seen = now;
        true
    }

    /// Apply a handshake. Counts as activity.
    pub fn set_type_tag(&mut self, id: ConnectionId, tag: &str, now: Instant) -> bool {
        let Some(conn) = self.conns.get_mut(&id) else {
            return false;
        };
        tag.clone_into(&mut conn.type_tag);
        conn.last_seen = now;
        true
    }

    pub fn sender(&self, id: ConnectionId) -> Option<mpsc::Sender<Outbound>> {
        self.conns.get(&id).map(|conn| conn.tx.clone())
    }

    /// Senders for every connection, or only those whose tag matches.
    pub fn targets(&self, type_filter: Option<&str>) -> Vec<(ConnectionId, mpsc::Sender<Outbound>)> {
        self.conns
            .values()
            .filter(|conn| type_filter.is_none_or(|tag| conn.type_tag == tag))
            .map(|conn| (conn.id, conn.tx.clone()))
            .collect()
    }

    /// Remove and return every connection idle for longer than `timeout`.
    pub fn take_expired(&mut self, now: Instant, timeout: Duration) -> Vec<ClientConnection> {
        let expired: Vec<ConnectionId> = self
            .conns
            .values()
            .filter(|conn| now.saturating_duration_since(conn.last_seen) > timeout)
            .map(|conn| conn.id)
            .collect();
        expired.into_iter().filter_map(|id| self.conns.remove(&id)).collect()
    }

    pub fn drain(&mut self) -> Vec<ClientConnection> {
        self.conns.drain().map(|(_, conn)| conn).collect()
    }

    pub fn snapshot(&self, now: Instant) -> Vec<ConnectionInfo> {
        let mut out: Vec<ConnectionInfo> = self.conns.values().map(|conn| conn.info(now)).collect();
        out.sort_by(|a, b| b.connected_secs.total_cmp(&a.connected_secs));
        out
    }
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod tests;
