//! Message: the universal payload exchanged by server and client.
//!
//! DESIGN
//! ======
//! The wire carries flat JSON objects keyed by a `type` string. Rather than
//! passing raw maps around, inbound objects are classified once into a sum
//! type so dispatch can match exhaustively. Every variant keeps the complete
//! field map, so unknown keys survive a decode/encode cycle and business
//! handlers still see everything the peer sent.
//!
//! Classification order matters: any object carrying `client_type` is a
//! handshake, regardless of its `type`.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::{ErrorCode, RelayError};

// =============================================================================
// FIELD CONSTANTS
// =============================================================================

pub const FIELD_TYPE: &str = "type";
pub const FIELD_CLIENT_TYPE: &str = "client_type";
pub const FIELD_CLIENT_ID: &str = "client_id";
pub const FIELD_SERVER_TIME: &str = "server_time";
pub const FIELD_TIMESTAMP: &str = "timestamp";
pub const FIELD_MESSAGE: &str = "message";
pub const FIELD_ERROR: &str = "error";
pub const FIELD_CODE: &str = "code";

pub const TYPE_HEARTBEAT: &str = "heartbeat";
pub const TYPE_WELCOME: &str = "welcome";
pub const TYPE_CONNECTION_ESTABLISHED: &str = "connection_established";
pub const TYPE_ERROR: &str = "error";

/// Legacy type sent directly by the Unity front end.
pub const TYPE_QUESTION: &str = "question";

/// Handler type that legacy `question` messages are redirected to.
pub const TYPE_TASK_NEW: &str = "task_new";

/// Protocol revision announced in client handshakes.
pub const PROTOCOL_VERSION: &str = "2.1";

// =============================================================================
// TYPES
// =============================================================================

/// Open key/value payload. Alias to reduce noise in signatures.
pub type Payload = serde_json::Map<String, Value>;

/// A classified wire message. `payload` always holds the full object.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Declares the sender's type tag. Re-runnable.
    Handshake { client_type: String, payload: Payload },
    /// Application-level liveness beat (either direction).
    Heartbeat { payload: Payload },
    /// First message the server sends on accept.
    Welcome { client_id: Option<String>, payload: Payload },
    /// Server acknowledgment of a handshake.
    ConnectionEstablished { client_id: Option<String>, payload: Payload },
    /// Error report from the peer.
    Error { error: String, payload: Payload },
    /// Any other typed message, routed to registered handlers.
    Custom { kind: String, payload: Payload },
    /// Neither `client_type` nor `type` present.
    Untyped { payload: Payload },
}

// =============================================================================
// CLASSIFICATION
// =============================================================================

impl Message {
    /// Classify a raw field map.
    #[must_use]
    pub fn from_payload(payload: Payload) -> Self {
        if let Some(value) = payload.get(FIELD_CLIENT_TYPE) {
            let client_type = value
                .as_str()
                .map_or_else(|| value.to_string(), ToOwned::to_owned);
            return Self::Handshake { client_type, payload };
        }

        let Some(kind) = payload.get(FIELD_TYPE).and_then(Value::as_str) else {
            return Self::Untyped { payload };
        };

        match kind {
            TYPE_HEARTBEAT => Self::Heartbeat { payload },
            TYPE_WELCOME => {
                let client_id = string_field(&payload, FIELD_CLIENT_ID);
                Self::Welcome { client_id, payload }
            }
            TYPE_CONNECTION_ESTABLISHED => {
                let client_id = string_field(&payload, FIELD_CLIENT_ID);
                Self::ConnectionEstablished { client_id, payload }
            }
            TYPE_ERROR => {
                let error = string_field(&payload, FIELD_MESSAGE)
                    .or_else(|| string_field(&payload, FIELD_ERROR))
                    .unwrap_or_else(|| "unknown error".to_owned());
                Self::Error { error, payload }
            }
            other => Self::Custom { kind: other.to_owned(), payload },
        }
    }

    /// Classify a decoded JSON value. Non-objects are a protocol error.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Protocol`] if `value` is not a JSON object.
    pub fn from_value(value: Value) -> Result<Self, RelayError> {
        match value {
            Value::Object(payload) => Ok(Self::from_payload(payload)),
            other => Err(RelayError::Protocol(format!(
                "message must be a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Decode one complete UTF-8 JSON unit.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Framing`] for invalid JSON and
    /// [`RelayError::Protocol`] for valid JSON that is not an object.
    pub fn parse(bytes: &[u8]) -> Result<Self, RelayError> {
        let value: Value = serde_json::from_slice(bytes).map_err(|e| RelayError::Framing(format!("invalid json: {e}")))?;
        Self::from_value(value)
    }

    /// The full field map.
    #[must_use]
    pub fn payload(&self) -> &Payload {
        match self {
            Self::Handshake { payload, .. }
            | Self::Heartbeat { payload }
            | Self::Welcome { payload, .. }
            | Self::ConnectionEstablished { payload, .. }
            | Self::Error { payload, .. }
            | Self::Custom { payload, .. }
            | Self::Untyped { payload } => payload,
        }
    }

    #[must_use]
    pub fn into_payload(self) -> Payload {
        match self {
            Self::Handshake { payload, .. }
            | Self::Heartbeat { payload }
            | Self::Welcome { payload, .. }
            | Self::ConnectionEstablished { payload, .. }
            | Self::Error { payload, .. }
            | Self::Custom { payload, .. }
            | Self::Untyped { payload } => payload,
        }
    }

    /// The `type` field, if it is a string.
    #[must_use]
    pub fn kind(&self) -> Option<&str> {
        self.payload().get(FIELD_TYPE).and_then(Value::as_str)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload().get(key)
    }

    #[must_use]
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Self::Heartbeat { .. })
    }

    /// Serialize to a compact JSON string.
    ///
    /// # Errors
    ///
    /// Returns a serde error if a payload value cannot be serialized.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self.payload())
    }
}

// =============================================================================
// CONSTRUCTORS
// =============================================================================

impl Message {
    /// Create a typed message with an empty payload.
    pub fn new(kind: impl Into<String>) -> Self {
        let kind = kind.into();
        let mut payload = Payload::new();
        payload.insert(FIELD_TYPE.into(), Value::String(kind));
        Self::from_payload(payload)
    }

    /// Server greeting sent immediately after accept.
    #[must_use]
    pub fn welcome(client_id: &str) -> Self {
        let mut payload = Payload::new();
        payload.insert(FIELD_TYPE.into(), TYPE_WELCOME.into());
        payload.insert(FIELD_CLIENT_ID.into(), client_id.into());
        payload.insert(FIELD_MESSAGE.into(), "welcome to the simrelay server".into());
        payload.insert(FIELD_SERVER_TIME.into(), now_secs().into());
        Self::Welcome { client_id: Some(client_id.to_owned()), payload }
    }

    /// Handshake acknowledgment.
    #[must_use]
    pub fn connection_established(client_id: &str, client_type: &str) -> Self {
        let mut payload = Payload::new();
        payload.insert(FIELD_TYPE.into(), TYPE_CONNECTION_ESTABLISHED.into());
        payload.insert(FIELD_CLIENT_ID.into(), client_id.into());
        payload.insert(FIELD_MESSAGE.into(), format!("connection established ({client_type})").into());
        payload.insert(FIELD_SERVER_TIME.into(), now_secs().into());
        Self::ConnectionEstablished { client_id: Some(client_id.to_owned()), payload }
    }

    /// Heartbeat stamped with the server clock.
    #[must_use]
    pub fn server_heartbeat() -> Self {
        let mut payload = Payload::new();
        payload.insert(FIELD_TYPE.into(), TYPE_HEARTBEAT.into());
        payload.insert(FIELD_SERVER_TIME.into(), now_secs().into());
        Self::Heartbeat { payload }
    }

    /// Heartbeat stamped with the client clock and server-assigned id.
    #[must_use]
    pub fn client_heartbeat(client_id: Option<&str>) -> Self {
        let mut payload = Payload::new();
        payload.insert(FIELD_TYPE.into(), TYPE_HEARTBEAT.into());
        payload.insert(FIELD_TIMESTAMP.into(), now_secs().into());
        payload.insert(FIELD_CLIENT_ID.into(), client_id.map_or(Value::Null, Value::from));
        Self::Heartbeat { payload }
    }

    /// Client handshake declaring its type tag.
    #[must_use]
    pub fn handshake(client_type: &str) -> Self {
        let mut system_info = Payload::new();
        system_info.insert("crate_version".into(), env!("CARGO_PKG_VERSION").into());
        system_info.insert("os".into(), std::env::consts::OS.into());
        system_info.insert("arch".into(), std::env::consts::ARCH.into());

        let mut payload = Payload::new();
        payload.insert(FIELD_CLIENT_TYPE.into(), client_type.into());
        payload.insert(FIELD_TIMESTAMP.into(), now_secs().into());
        payload.insert("version".into(), PROTOCOL_VERSION.into());
        payload.insert("system_info".into(), Value::Object(system_info));
        Self::Handshake { client_type: client_type.to_owned(), payload }
    }

    /// Structured error reply from a typed error.
    #[must_use]
    pub fn error_from(err: &(impl ErrorCode + ?Sized)) -> Self {
        let text = err.to_string();
        let mut payload = Payload::new();
        payload.insert(FIELD_TYPE.into(), TYPE_ERROR.into());
        payload.insert(FIELD_CODE.into(), err.error_code().into());
        payload.insert(FIELD_ERROR.into(), text.clone().into());
        payload.insert(FIELD_MESSAGE.into(), text.clone().into());
        payload.insert(FIELD_SERVER_TIME.into(), now_secs().into());
        Self::Error { error: text, payload }
    }
}

// =============================================================================
// BUILDERS
// =============================================================================

impl Message {
    /// Insert a field and reclassify (a builder may add `client_type`).
    #[must_use]
    pub fn with_data(self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut payload = self.into_payload();
        payload.insert(key.into(), value.into());
        Self::from_payload(payload)
    }

    /// Merge every field of `extra` into the payload.
    #[must_use]
    pub fn with_payload(self, extra: Payload) -> Self {
        let mut payload = self.into_payload();
        payload.extend(extra);
        Self::from_payload(payload)
    }
}

// =============================================================================
// SERDE
// =============================================================================

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.payload().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Payload::deserialize(deserializer).map(Self::from_payload)
    }
}

impl TryFrom<Value> for Message {
    type Error = RelayError;

    fn try_from(value: Value) -> Result<Self, RelayError> {
        Self::from_value(value)
    }
}

// =============================================================================
// HELPERS
// =============================================================================

/// Current time as fractional seconds since the Unix epoch.
#[must_use]
pub fn now_secs() -> f64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0.0;
    };
    dur.as_secs_f64()
}

fn string_field(payload: &Payload, key: &str) -> Option<String> {
    payload.get(key).and_then(Value::as_str).map(ToOwned::to_owned)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
#[path = "message_test.rs"]
mod tests;
