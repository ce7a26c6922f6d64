//! Frame decoder: turns raw transport bytes into classified messages.
//!
//! DESIGN
//! ======
//! Stream transports carry no length prefix, so a per-connection decoder
//! buffers bytes until a complete unit is available. Two modes exist:
//!
//! - `Lines`: one JSON object per `\n`-terminated line. Unambiguous, and the
//!   default for new peers.
//! - `Concatenated`: bare JSON values written back to back (the legacy Unity
//!   client). Values are pulled off the front of the buffer with serde's
//!   streaming deserializer; an incomplete tail stays buffered.
//!
//! In both modes the literal `ping` is a raw liveness probe answered with
//! `pong` before any JSON parsing happens. A buffer that grows past
//! `max_message_size` without yielding a unit is discarded with a framing
//! error; the connection itself survives.

use serde_json::Value;

use crate::config::FramingMode;
use crate::error::RelayError;
use crate::message::Message;

const PING: &[u8] = b"ping";

/// One decoded unit from the inbound byte stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// Raw `ping` probe.
    Ping,
    Message(Message),
    /// A unit that could not become a message. Reported to the peer.
    Invalid(RelayError),
}

// =============================================================================
// STREAM DECODER
// =============================================================================

#[derive(Debug)]
pub struct FrameDecoder {
    mode: FramingMode,
    max_size: usize,
    buf: Vec<u8>,
}

impl FrameDecoder {
    #[must_use]
    pub fn new(mode: FramingMode, max_size: usize) -> Self {
        Self { mode, max_size, buf: Vec::new() }
    }

    /// Bytes currently held waiting for a complete unit.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Append `bytes` and return every unit that is now complete.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Decoded> {
        self.buf.extend_from_slice(bytes);
        let mut out = match self.mode {
            FramingMode::Lines => self.drain_lines(),
            FramingMode::Concatenated => self.drain_concatenated(),
        };

        if self.buf.len() > self.max_size {
            let len = self.buf.len();
            self.buf.clear();
            out.push(Decoded::Invalid(RelayError::Framing(format!(
                "buffered {len} bytes without a complete message (max {})",
                self.max_size
            ))));
        }
        out
    }

    fn drain_lines(&mut self) -> Vec<Decoded> {
        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = line.trim_ascii();
            if line.is_empty() {
                continue;
            }
            if line.len() > self.max_size {
                out.push(Decoded::Invalid(RelayError::Framing(format!(
                    "message of {} bytes exceeds max {}",
                    line.len(),
                    self.max_size
                ))));
                continue;
            }
            out.push(decode_bytes(line));
        }

        // A bare probe from a peer that does not terminate lines.
        if self.buf == PING {
            self.buf.clear();
            out.push(Decoded::Ping);
        }
        out
    }

    fn drain_concatenated(&mut self) -> Vec<Decoded> {
        if self.buf == PING {
            self.buf.clear();
            return vec![Decoded::Ping];
        }

        let mut out = Vec::new();
        let consumed = {
            let mut stream = serde_json::Deserializer::from_slice(&self.buf).into_iter::<Value>();
            // Errors (incomplete tail or garbage) leave the rest buffered;
            // the size cutoff in `push` bounds how long garbage can linger.
            while let Some(Ok(value)) = stream.next() {
                out.push(match Message::from_value(value) {
                    Ok(msg) => Decoded::Message(msg),
                    Err(e) => Decoded::Invalid(e),
                });
            }
            stream.byte_offset()
        };
        self.buf.drain(..consumed);

        if self.buf.iter().all(u8::is_ascii_whitespace) {
            self.buf.clear();
        }
        out
    }
}

// =============================================================================
// UNIT DECODING / ENCODING
// =============================================================================

/// Decode one whole unit from a message-oriented transport.
#[must_use]
pub fn decode_unit(bytes: &[u8], max_size: usize) -> Decoded {
    if bytes.len() > max_size {
        return Decoded::Invalid(RelayError::Framing(format!(
            "message of {} bytes exceeds max {max_size}",
            bytes.len()
        )));
    }
    decode_bytes(bytes.trim_ascii())
}

fn decode_bytes(bytes: &[u8]) -> Decoded {
    if bytes == PING {
        return Decoded::Ping;
    }
    match Message::parse(bytes) {
        Ok(msg) => Decoded::Message(msg),
        Err(e) => Decoded::Invalid(e),
    }
}

/// Encode an outbound message for a stream transport.
///
/// # Errors
///
/// Returns a serde error if the payload cannot be serialized.
pub fn encode(mode: FramingMode, msg: &Message) -> Result<Vec<u8>, serde_json::Error> {
    let mut bytes = serde_json::to_vec(msg)?;
    if mode == FramingMode::Lines {
        bytes.push(b'\n');
    }
    Ok(bytes)
}

/// Probe reply for a stream transport.
#[must_use]
pub fn pong(mode: FramingMode) -> &'static [u8] {
    match mode {
        FramingMode::Lines => b"pong\n",
        FramingMode::Concatenated => b"pong",
    }
}

#[cfg(test)]
#[path = "framing_test.rs"]
mod tests;
