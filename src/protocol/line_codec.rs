//! Newline-delimited JSON framing.
//!
//! [`LineDecoder`] accumulates partial socket reads in a `BytesMut` and
//! emits one decoded object per complete line. Partial lines stay buffered
//! for the next push; a line that grows past the configured maximum without
//! a terminator is a protocol error (guards memory against a peer that
//! never sends a newline).
//!
//! Encoding is injectable: an [`Encoder`] maps a message object to the bytes
//! written on the wire. The default is UTF-8 JSON plus a trailing `\n`.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use serde_json::Value;

use crate::error::{RelinkError, Result};

/// Default cap on a single undelimited line.
pub const DEFAULT_MAX_LINE: usize = 16 * 1024 * 1024;

/// Pluggable message encoder.
pub type Encoder = Arc<dyn Fn(&Value) -> Bytes + Send + Sync>;

/// The default encoder: JSON text plus a trailing newline.
pub fn default_encoder() -> Encoder {
    Arc::new(encode_line)
}

/// Encode one message as a JSON line.
pub fn encode_line(msg: &Value) -> Bytes {
    let mut buf = serde_json::to_vec(msg).expect("serializing a Value cannot fail");
    buf.push(b'\n');
    Bytes::from(buf)
}

/// Incremental decoder for newline-delimited JSON.
///
/// Consumed fresh per connection; leftover state from a previous connection
/// is never valid after a reconnect.
pub struct LineDecoder {
    buffer: BytesMut,
    max_line: usize,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::with_max_line(DEFAULT_MAX_LINE)
    }

    /// Create a decoder with a custom line length cap.
    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8 * 1024),
            max_line,
        }
    }

    /// Push raw bytes and extract every complete decoded object.
    ///
    /// Blank lines are skipped. Lines that are not valid JSON are logged
    /// and skipped rather than killing the connection.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Value>> {
        self.buffer.extend_from_slice(data);

        let mut decoded = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line = self.buffer.split_to(pos + 1);
            let mut line = &line[..pos];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<Value>(line) {
                Ok(value) => decoded.push(value),
                Err(error) => {
                    tracing::warn!(%error, "skipping undecodable line");
                }
            }
        }

        if self.buffer.len() > self.max_line {
            return Err(RelinkError::Protocol(format!(
                "line exceeds {} bytes without terminator",
                self.max_line
            )));
        }

        Ok(decoded)
    }

    /// Number of buffered bytes awaiting a terminator.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new()
    }
}
