//! Observable session counters and status snapshots.
//!
//! Purely observational: nothing in the session reads these to make a
//! decision.

use std::time::Duration;

use serde::Serialize;

/// Lifecycle state of a [`super::ClientSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal. Set by `stop()`.
    Stopped,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Stopped => "stopped",
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Stats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_queued: u64,
    pub messages_dropped: u64,
    pub connection_attempts: u64,
    pub successful_connections: u64,
    pub disconnections: u64,
    /// Transport, liveness, framing and capacity errors seen locally.
    pub errors: u64,
    /// `error` messages received from the server.
    pub server_errors: u64,
    pub handler_errors: u64,
    pub last_error: Option<String>,
    /// Uptime of completed connections.
    #[serde(skip)]
    pub total_uptime: Duration,
}

impl Stats {
    pub(crate) fn record_error(&mut self, error: impl std::fmt::Display) {
        self.errors += 1;
        self.last_error = Some(error.to_string());
    }
}

/// Serializable point-in-time view returned by `ClientSession::status()`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub state: ConnectionState,
    pub url: String,
    pub client_type: String,
    pub client_id: Option<String>,
    pub reconnect_attempts: u32,
    pub max_reconnect_attempts: u32,
    pub queue_len: usize,
    pub queue_capacity: usize,
    /// Seconds since the current connection was established.
    pub uptime_secs: Option<f64>,
    /// Completed connections plus the current one.
    pub total_uptime_secs: f64,
    pub stats: Stats,
}
