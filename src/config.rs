//! Configuration for server and client, loaded from YAML + environment.
//!
//! DESIGN
//! ======
//! Precedence, lowest to highest: compiled defaults, the YAML file
//! (`config/simrelay.yaml` unless a path is given), `.env`, process env.
//! Durations are written as fractional seconds everywhere so the file and
//! the environment read the same way.
//!
//! Unparseable env overrides are ignored with a warning rather than failing
//! startup; structurally invalid combinations fail `validate`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::warn;

use crate::error::ConfigError;

pub const DEFAULT_CONFIG_PATH: &str = "config/simrelay.yaml";

const ENV_PREFIX: &str = "SIMRELAY_";

// =============================================================================
// FRAMING MODE
// =============================================================================

/// How the raw TCP transport delimits messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FramingMode {
    /// Newline-delimited JSON.
    #[default]
    Lines,
    /// Back-to-back JSON objects with no delimiter (legacy Unity client).
    Concatenated,
}

impl std::str::FromStr for FramingMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lines" | "ndjson" => Ok(Self::Lines),
            "concatenated" | "legacy" => Ok(Self::Concatenated),
            other => Err(ConfigError::Invalid(format!("unknown framing mode: {other}"))),
        }
    }
}

// =============================================================================
// SERVER
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    /// Raw TCP port. `0` picks an ephemeral port.
    pub port: u16,
    /// Optional WebSocket port serving `/ws`.
    pub ws_port: Option<u16>,
    #[serde(with = "secs")]
    pub heartbeat_interval: Duration,
    #[serde(with = "secs")]
    pub connection_timeout: Duration,
    #[serde(with = "secs")]
    pub sweep_interval: Duration,
    pub max_message_size: usize,
    pub framing: FramingMode,
    /// Per-connection outbound channel capacity.
    pub outbound_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 12339,
            ws_port: None,
            heartbeat_interval: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(10),
            max_message_size: 1024 * 1024,
            framing: FramingMode::Lines,
            outbound_buffer: 256,
        }
    }
}

impl ServerConfig {
    /// Apply `SIMRELAY_*` overrides from an env-like lookup.
    pub fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        override_string(lookup, "HOST", &mut self.host);
        override_parse(lookup, "PORT", &mut self.port);
        if let Some(port) = parse_var::<u16>(lookup, "WS_PORT") {
            self.ws_port = Some(port);
        }
        override_secs(lookup, "HEARTBEAT_INTERVAL", &mut self.heartbeat_interval);
        override_secs(lookup, "CONNECTION_TIMEOUT", &mut self.connection_timeout);
        override_secs(lookup, "SWEEP_INTERVAL", &mut self.sweep_interval);
        override_parse(lookup, "MAX_MESSAGE_SIZE", &mut self.max_message_size);
        override_parse(lookup, "FRAMING", &mut self.framing);
    }

    /// Reject settings the server loops cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_nonzero(self.heartbeat_interval, "server.heartbeat_interval")?;
        require_nonzero(self.connection_timeout, "server.connection_timeout")?;
        require_nonzero(self.sweep_interval, "server.sweep_interval")?;
        if self.max_message_size == 0 {
            return Err(ConfigError::Invalid("server.max_message_size must be > 0".into()));
        }
        if self.outbound_buffer == 0 {
            return Err(ConfigError::Invalid("server.outbound_buffer must be > 0".into()));
        }
        Ok(())
    }

    #[must_use]
    pub fn tcp_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    #[must_use]
    pub fn ws_addr(&self) -> Option<String> {
        self.ws_port.map(|port| format!("{}:{port}", self.host))
    }
}

// =============================================================================
// CLIENT
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub url: String,
    pub client_type: String,
    pub auto_reconnect: bool,
    pub max_reconnect_attempts: u32,
    /// Backoff base for the first reconnect attempt.
    #[serde(with = "secs")]
    pub reconnect_interval: Duration,
    /// Upper bound on the un-jittered backoff.
    #[serde(with = "secs")]
    pub reconnect_cap: Duration,
    #[serde(with = "secs")]
    pub heartbeat_interval: Duration,
    #[serde(with = "secs")]
    pub connection_timeout: Duration,
    #[serde(with = "secs")]
    pub connect_timeout: Duration,
    #[serde(with = "secs")]
    pub send_timeout: Duration,
    #[serde(with = "secs")]
    pub close_timeout: Duration,
    pub max_message_size: usize,
    #[serde(with = "secs")]
    pub ping_interval: Duration,
    #[serde(with = "secs")]
    pub ping_timeout: Duration,
    #[serde(with = "secs")]
    pub liveness_check_interval: Duration,
    pub queue_capacity: usize,
    /// Pause between queued messages during a flush.
    #[serde(with = "secs")]
    pub flush_pacing: Duration,
    /// Pause after a successful reconnect before flushing.
    #[serde(with = "secs")]
    pub reconnect_settle: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8765/ws".into(),
            client_type: "generic".into(),
            auto_reconnect: true,
            max_reconnect_attempts: 15,
            reconnect_interval: Duration::from_secs(3),
            reconnect_cap: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(20),
            connection_timeout: Duration::from_secs(40),
            connect_timeout: Duration::from_secs(20),
            send_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(5),
            max_message_size: 2 * 1024 * 1024,
            ping_interval: Duration::from_secs(15),
            ping_timeout: Duration::from_secs(10),
            liveness_check_interval: Duration::from_secs(5),
            queue_capacity: 100,
            flush_pacing: Duration::from_millis(100),
            reconnect_settle: Duration::from_millis(500),
        }
    }
}

impl ClientConfig {
    /// Apply `SIMRELAY_*` overrides from an env-like lookup.
    pub fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        override_string(lookup, "URL", &mut self.url);
        override_string(lookup, "CLIENT_TYPE", &mut self.client_type);
        override_parse(lookup, "AUTO_RECONNECT", &mut self.auto_reconnect);
        override_parse(lookup, "MAX_RECONNECT_ATTEMPTS", &mut self.max_reconnect_attempts);
        override_secs(lookup, "RECONNECT_INTERVAL", &mut self.reconnect_interval);
        override_secs(lookup, "RECONNECT_CAP", &mut self.reconnect_cap);
        override_secs(lookup, "HEARTBEAT_INTERVAL", &mut self.heartbeat_interval);
        override_secs(lookup, "CONNECTION_TIMEOUT", &mut self.connection_timeout);
        override_secs(lookup, "SEND_TIMEOUT", &mut self.send_timeout);
        override_secs(lookup, "CLOSE_TIMEOUT", &mut self.close_timeout);
        override_parse(lookup, "MAX_MESSAGE_SIZE", &mut self.max_message_size);
        override_secs(lookup, "PING_INTERVAL", &mut self.ping_interval);
        override_secs(lookup, "PING_TIMEOUT", &mut self.ping_timeout);
        override_parse(lookup, "QUEUE_CAPACITY", &mut self.queue_capacity);
    }

    /// Reject settings the session loops cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_nonzero(self.heartbeat_interval, "client.heartbeat_interval")?;
        require_nonzero(self.connection_timeout, "client.connection_timeout")?;
        require_nonzero(self.liveness_check_interval, "client.liveness_check_interval")?;
        require_nonzero(self.send_timeout, "client.send_timeout")?;
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("client.queue_capacity must be > 0".into()));
        }
        if self.reconnect_cap < self.reconnect_interval {
            return Err(ConfigError::Invalid(format!(
                "client.reconnect_cap ({:?}) is below client.reconnect_interval ({:?})",
                self.reconnect_cap, self.reconnect_interval
            )));
        }
        Ok(())
    }
}

// =============================================================================
// SETTINGS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub log_level: String,
    pub server: ServerConfig,
    pub client: ClientConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self { log_level: "info".into(), server: ServerConfig::default(), client: ClientConfig::default() }
    }
}

impl Settings {
    /// Load defaults, then the YAML file, then `.env` and process env.
    ///
    /// An explicit `path` must exist; the default path is optional.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the file cannot be read or parsed, or the
    /// merged result fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        // Missing .env is the common case.
        let _ = dotenvy::dotenv();

        let mut settings = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = PathBuf::from(DEFAULT_CONFIG_PATH);
                if default_path.exists() { Self::from_file(&default_path)? } else { Self::default() }
            }
        };
        settings.apply_overrides(&|key| std::env::var(key).ok());
        settings.validate()?;
        Ok(settings)
    }

    /// Parse a YAML file on top of the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] or [`ConfigError::Parse`].
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        Self::from_yaml(&raw).map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
    }

    /// Parse YAML text on top of the defaults. Empty text yields defaults.
    ///
    /// # Errors
    ///
    /// Returns the YAML error if the text does not match the schema.
    pub fn from_yaml(raw: &str) -> Result<Self, serde_yaml::Error> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw)
    }

    pub fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        override_string(lookup, "LOG_LEVEL", &mut self.log_level);
        self.server.apply_overrides(lookup);
        self.client.apply_overrides(lookup);
    }

    /// # Errors
    ///
    /// Returns the first invalid field found in either section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        self.client.validate()
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, suffix: &str) -> Option<T> {
    let key = format!("{ENV_PREFIX}{suffix}");
    let raw = lookup(&key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key = %key, value = %raw, "ignoring unparseable config override");
            None
        }
    }
}

fn override_parse<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, suffix: &str, slot: &mut T) {
    if let Some(value) = parse_var(lookup, suffix) {
        *slot = value;
    }
}

fn override_string(lookup: &impl Fn(&str) -> Option<String>, suffix: &str, slot: &mut String) {
    if let Some(value) = lookup(&format!("{ENV_PREFIX}{suffix}")).filter(|v| !v.is_empty()) {
        *slot = value;
    }
}

fn override_secs(lookup: &impl Fn(&str) -> Option<String>, suffix: &str, slot: &mut Duration) {
    let Some(secs) = parse_var::<f64>(lookup, suffix) else {
        return;
    };
    match Duration::try_from_secs_f64(secs) {
        Ok(duration) => *slot = duration,
        Err(_) => warn!(key = %format!("{ENV_PREFIX}{suffix}"), secs, "ignoring out-of-range duration override"),
    }
}

fn require_nonzero(value: Duration, field: &str) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::Invalid(format!("{field} must be > 0")));
    }
    Ok(())
}

/// Serde adapter: `Duration` as fractional seconds.
mod secs {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
