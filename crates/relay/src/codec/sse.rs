// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Incremental server-sent-events parser.
//!
//! Feed raw body chunks as they arrive; completed events come back in
//! order. Chunk boundaries are transparent: a `data:` line split across two
//! reads parses identically to one delivered whole.

/// One dispatched SSE event. Only the `data` field matters to the gateway;
/// `event`/`id`/`retry` lines are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub data: String,
}

#[derive(Debug, Default)]
pub struct SseParser {
    line_buf: Vec<u8>,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one chunk of the body stream, returning any events whose
    /// terminating blank line arrived within it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let mut events = Vec::new();
        for &byte in chunk {
            if byte != b'\n' {
                self.line_buf.push(byte);
                continue;
            }
            let mut line = std::mem::take(&mut self.line_buf);
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line).into_owned();
            if let Some(event) = self.take_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Process one complete line; a blank line may dispatch an event.
    fn take_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            // Dispatch. Events that never carried a data field are skipped.
            if self.data_lines.is_empty() {
                return None;
            }
            let data = std::mem::take(&mut self.data_lines).join("\n");
            return Some(SseEvent { data });
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        if field == "data" {
            self.data_lines.push(value.to_owned());
        }
        None
    }
}

#[cfg(test)]
#[path = "sse_tests.rs"]
mod tests;
