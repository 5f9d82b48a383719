// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Incremental newline-delimited JSON framing for backend stdio.

use serde_json::Value;
use tracing::warn;

/// Line-buffered NDJSON parser.
///
/// Carries a partial trailing line across reads. Lines that fail to parse
/// are logged and skipped; a broken frame must never take the session down.
#[derive(Debug, Default)]
pub struct NdjsonParser {
    line_buf: Vec<u8>,
}

impl NdjsonParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one chunk, returning the values parsed from every complete
    /// line it finished.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Value> {
        let mut values = Vec::new();
        for &byte in chunk {
            if byte != b'\n' {
                self.line_buf.push(byte);
                continue;
            }
            let mut line = std::mem::take(&mut self.line_buf);
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.is_empty() {
                continue;
            }
            match serde_json::from_slice::<Value>(&line) {
                Ok(value) => values.push(value),
                Err(e) => {
                    warn!(err = %e, len = line.len(), "skipping unparseable ndjson line");
                }
            }
        }
        values
    }

    /// Bytes of the current partial line (diagnostics only).
    pub fn pending_len(&self) -> usize {
        self.line_buf.len()
    }
}

#[cfg(test)]
#[path = "ndjson_tests.rs"]
mod tests;
