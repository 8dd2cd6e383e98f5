//! Incremental parsing of a `text/event-stream` byte feed.
//!
//! Each SSE message consists of:
//! - `event:` line (optional) specifying the event type
//! - `data:` line(s) containing the payload
//! - Empty line terminating the message
//!
//! Unlike a one-shot body parser, the feed arrives in arbitrary byte chunks
//! from a long-lived response, so the parser keeps partial lines and the
//! in-progress event across `feed` calls.

use serde::Deserialize;

/// A complete server-sent event.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    /// Event type, `message` when the stream did not name one.
    pub event: String,
    /// Data lines joined with newlines.
    pub data: String,
}

/// Payload of the `endpoint` handshake event an upstream sends first.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointEvent {
    pub endpoint: String,
    pub session_id: String,
}

const DEFAULT_EVENT: &str = "message";

/// Streaming SSE parser.
#[derive(Debug, Default)]
pub struct SseParser {
    /// Unterminated trailing line carried between chunks.
    partial: String,
    event_type: Option<String>,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes, returning every event completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.partial.push_str(&String::from_utf8_lossy(chunk));

        let mut events = Vec::new();
        while let Some(newline) = self.partial.find('\n') {
            let mut line: String = self.partial.drain(..=newline).collect();
            if line.ends_with('\n') {
                line.pop();
            }
            if line.ends_with('\r') {
                line.pop();
            }

            if let Some(event) = self.consume_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Process one complete line; an empty line dispatches the message.
    fn consume_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            if self.data_lines.is_empty() {
                // event type without data carries nothing
                self.event_type = None;
                return None;
            }
            let event = SseEvent {
                event: self.event_type.take().unwrap_or_else(|| DEFAULT_EVENT.to_string()),
                data: self.data_lines.join("\n"),
            };
            self.data_lines.clear();
            return Some(event);
        }

        // comment lines (keep-alives) start with a colon
        if line.starts_with(':') {
            return None;
        }

        if let Some(event) = line.strip_prefix("event:") {
            self.event_type = Some(event.trim().to_string());
        } else if let Some(data) = line.strip_prefix("data:") {
            self.data_lines.push(data.strip_prefix(' ').unwrap_or(data).to_string());
        }
        // other SSE fields (id, retry) are ignored

        None
    }
}
