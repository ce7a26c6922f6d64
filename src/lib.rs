//! simrelay: real-time messaging layer for the business-simulation stack.
//!
//! ARCHITECTURE
//! ============
//! Two halves share one wire model:
//! - `server`: accepts raw TCP and WebSocket connections into a single
//!   registry, answers handshakes and heartbeats, sweeps idle peers, and
//!   exposes unicast / broadcast to business handlers.
//! - `client`: a resilient WebSocket session that reconnects with jittered
//!   backoff, buffers sends while offline, and detects dead links.
//!
//! Every payload is a JSON object keyed by `type`, modelled as
//! [`message::Message`]. Handlers for both halves are registered through
//! [`dispatch::HandlerRegistry`].

pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod message;
pub mod server;

pub use client::{ClientSession, ConnectionState, StatusSnapshot};
pub use config::{ClientConfig, FramingMode, ServerConfig, Settings};
pub use dispatch::{HandlerError, HandlerRegistry};
pub use error::{ClientError, ConfigError, ErrorCode, RelayError, ServerError};
pub use message::{Message, Payload};
pub use server::{ConnectionId, Server, ServerContext};
