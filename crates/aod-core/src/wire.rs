use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

pub const HEARTBEAT_EVENT: &str = "heartbeat";
pub const CONNECTED_EVENT: &str = "connected";
pub const CLOSE_EVENT: &str = "close";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("malformed frame: {reason}")]
    MalformedFrame { reason: String },
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
}

/// The decoded unit of transmission. `payload` is opaque to this layer;
/// consumers interpret it per `event_type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub channel: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: Value,
}

impl EventEnvelope {
    /// Control events are connection bookkeeping and are never delivered
    /// to business consumers.
    pub fn is_control(&self) -> bool {
        matches!(
            self.event_type.as_str(),
            HEARTBEAT_EVENT | CONNECTED_EVENT | CLOSE_EVENT
        )
    }
}

/// Decode one SSE `data:` body into an envelope. Required fields must be
/// present and non-empty; the payload passes through unvalidated.
pub fn decode_envelope(data: &str) -> Result<EventEnvelope, WireError> {
    let envelope: EventEnvelope =
        serde_json::from_str(data).map_err(|err| WireError::MalformedFrame {
            reason: err.to_string(),
        })?;
    if envelope.id.is_empty() || envelope.event_type.is_empty() || envelope.channel.is_empty() {
        return Err(WireError::MalformedFrame {
            reason: "empty id, type, or channel".to_string(),
        });
    }
    Ok(envelope)
}

#[derive(Debug, Clone, Default)]
pub struct DecodeReport {
    pub envelopes: Vec<EventEnvelope>,
    pub errors: Vec<WireError>,
}

/// Incremental decoder for the SSE wire stream.
///
/// Bytes arrive in arbitrary chunk boundaries; frames are terminated by a
/// blank line. Only `data:` lines carry information (the server repeats the
/// event id and type inside the JSON body); comments and other fields are
/// skipped. A malformed frame is reported and dropped without disturbing
/// the frames that follow it.
pub struct SseFrameDecoder {
    max_frame_bytes: usize,
    line_buf: Vec<u8>,
    data_lines: Vec<String>,
}

impl SseFrameDecoder {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            line_buf: Vec::new(),
            data_lines: Vec::new(),
        }
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) -> DecodeReport {
        let mut report = DecodeReport::default();
        for &byte in chunk {
            if byte == b'\n' {
                let mut line = std::mem::take(&mut self.line_buf);
                if line.ends_with(b"\r") {
                    line.pop();
                }
                self.handle_line(&line, &mut report);
            } else {
                self.line_buf.push(byte);
                if self.line_buf.len() > self.max_frame_bytes {
                    report.errors.push(WireError::OversizedFrame {
                        size: self.line_buf.len(),
                        max: self.max_frame_bytes,
                    });
                    self.line_buf.clear();
                    self.data_lines.clear();
                }
            }
        }
        report
    }

    fn handle_line(&mut self, line: &[u8], report: &mut DecodeReport) {
        if line.is_empty() {
            if self.data_lines.is_empty() {
                return;
            }
            let data = self.data_lines.join("\n");
            self.data_lines.clear();
            match decode_envelope(&data) {
                Ok(envelope) => report.envelopes.push(envelope),
                Err(err) => report.errors.push(err),
            }
            return;
        }

        let Ok(text) = std::str::from_utf8(line) else {
            report.errors.push(WireError::MalformedFrame {
                reason: "non-utf8 line".to_string(),
            });
            return;
        };
        if text.starts_with(':') {
            return;
        }

        let (field, value) = match text.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (text, ""),
        };
        if field != "data" {
            return;
        }

        self.data_lines.push(value.to_string());
        let buffered: usize = self.data_lines.iter().map(String::len).sum();
        if buffered > self.max_frame_bytes {
            report.errors.push(WireError::OversizedFrame {
                size: buffered,
                max: self.max_frame_bytes,
            });
            self.data_lines.clear();
        }
    }
}

impl Default for SseFrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}
