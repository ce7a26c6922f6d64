//! Error taxonomy shared by server and client.
//!
//! DESIGN
//! ======
//! `RelayError` is the wire-facing taxonomy: every variant maps to a grepable
//! code that travels inside `error` replies. The remaining enums cover
//! process-level failures (binding, connecting, configuration) that surface to
//! the owning program as `Result`s instead of peer replies.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

// =============================================================================
// ERROR CODES
// =============================================================================

/// Grepable error code carried by structured error replies.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;
}

// =============================================================================
// RELAY ERROR
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    /// Connect / send / receive failure on the underlying transport.
    #[error("transport error: {0}")]
    Transport(String),
    /// Malformed or oversized payload.
    #[error("framing error: {0}")]
    Framing(String),
    /// Message lacking both `client_type` and `type`, or an unhandled type.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// A registered callback failed.
    #[error("handler error: {0}")]
    Handler(String),
    /// No heartbeat, message, or ping response inside the liveness window.
    #[error("liveness timeout after {0:?}")]
    LivenessTimeout(Duration),
    /// Outbound queue is at capacity; the message was dropped.
    #[error("outbound queue full (capacity {capacity})")]
    Capacity { capacity: usize },
}

impl ErrorCode for RelayError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Transport(_) => "E_TRANSPORT",
            Self::Framing(_) => "E_FRAMING",
            Self::Protocol(_) => "E_PROTOCOL",
            Self::Handler(_) => "E_HANDLER",
            Self::LivenessTimeout(_) => "E_LIVENESS",
            Self::Capacity { .. } => "E_CAPACITY",
        }
    }
}

// =============================================================================
// PROCESS-LEVEL ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read local address: {0}")]
    LocalAddr(#[from] std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("session stopped")]
    Stopped,
    #[error("connect to {url} timed out after {timeout:?}")]
    ConnectTimeout { url: String, timeout: Duration },
    #[error("websocket connect failed: {0}")]
    WsConnect(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("handshake failed: {0}")]
    Handshake(RelayError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Peer address helper for log fields.
pub(crate) fn peer_label(addr: Option<SocketAddr>) -> String {
    addr.map_or_else(|| "-".to_owned(), |a| a.to_string())
}
