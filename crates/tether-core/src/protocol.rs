//! Wire formats shared by the terminal bridge and the telemetry hub.
//!
//! Client -> server terminal frames are a small JSON envelope, but naive clients
//! may stream raw keystrokes instead, so anything that is not an envelope is
//! kept as [`ControlMessage::Unrecognized`] and forwarded to the shell as is.
//! Server -> client terminal output is never wrapped.

use serde::{Deserialize, Serialize};
use tether_common::Size;

/// A parsed terminal frame from the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Keystrokes for the shell
    Input(Vec<u8>),
    /// New window size, not yet validated
    Resize(Size),
    /// Keepalive, answered with `{"type":"pong"}`
    Ping,
    /// A well-formed envelope with a type we do not handle
    Unknown(String),
    /// Not an envelope at all; raw input
    Unrecognized(Vec<u8>),
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    data: String,
    #[serde(default)]
    rows: u16,
    #[serde(default)]
    cols: u16,
}

impl ControlMessage {
    pub fn parse(payload: &[u8]) -> Self {
        let msg: WireMessage = match serde_json::from_slice(payload) {
            Ok(msg) => msg,
            Err(_) => return ControlMessage::Unrecognized(payload.to_vec()),
        };

        match msg.kind.as_str() {
            "input" => ControlMessage::Input(msg.data.into_bytes()),
            "resize" => ControlMessage::Resize(Size::new(msg.rows, msg.cols)),
            "ping" => ControlMessage::Ping,
            _ => ControlMessage::Unknown(msg.kind),
        }
    }
}

/// `{"type":"pong"}`
pub fn pong() -> String {
    r#"{"type":"pong"}"#.to_string()
}

/// Sent once when a terminal session cannot start
#[derive(Debug, Serialize)]
pub struct ErrorFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    error: &'a str,
}

impl<'a> ErrorFrame<'a> {
    pub fn new(error: &'a str) -> Self {
        Self {
            kind: "error",
            error,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"error","error":""}"#.to_string())
    }
}

/// Tagged server push: `{"type": ..., "data": ..., "timestamp": <unix secs>}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope<T> {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: T,
    pub timestamp: i64,
}

/// Splits PTY output into text frames without breaking multi-byte characters.
///
/// A UTF-8 sequence cut across two reads is held back and prefixed to the next
/// chunk. Bytes that can never form valid UTF-8 are replaced; escape sequences
/// are ASCII and always pass through untouched.
#[derive(Debug, Default)]
pub struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                        // Incomplete sequence at the end; keep it for next time.
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        let remainder = rest.to_vec();
        self.pending = remainder;
        out
    }

    /// Bytes held back waiting for the rest of a character
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Drain whatever is held back. A truncated character becomes U+FFFD.
    pub fn finish(&mut self) -> String {
        let pending = std::mem::take(&mut self.pending);
        String::from_utf8_lossy(&pending).into_owned()
    }
}
