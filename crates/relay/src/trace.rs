// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Trace ids and log redaction.

use rand::RngCore;

/// Generate a short hex trace id for correlating one consumer command across
/// the slash chain, adapters, and the event bus.
pub fn trace_id() -> String {
    let mut bytes = [0u8; 6];
    rand::rng().fill_bytes(&mut bytes);
    let mut out = String::with_capacity(12);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Prefixes whose following token is always secret material.
const SECRET_PREFIXES: &[&str] = &["bearer", "token=", "api_key=", "apikey=", "authorization:"];

/// Scrub obvious credentials from a log line before it reaches the process
/// log ring or tracing output.
///
/// Whole-token replacement only: the scanner never tries to preserve a
/// recognizable prefix of a secret.
pub fn redact(line: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut redact_next = false;
    for word in line.split_whitespace() {
        if redact_next {
            out.push("[redacted]".to_owned());
            redact_next = false;
            continue;
        }
        let lower = word.to_lowercase();
        if let Some(prefix) = SECRET_PREFIXES.iter().find(|p| lower.starts_with(**p)) {
            if prefix.ends_with('=') || prefix.ends_with(':') {
                // Inline form: `token=abc123`.
                if word.len() > prefix.len() {
                    out.push(format!("{}[redacted]", &word[..prefix.len()]));
                } else {
                    out.push(word.to_owned());
                    redact_next = true;
                }
            } else {
                // Two-token form: `Bearer abc123`.
                out.push(word.to_owned());
                redact_next = true;
            }
            continue;
        }
        if lower.starts_with("sk-") && word.len() > 8 {
            out.push("[redacted]".to_owned());
            continue;
        }
        out.push(word.to_owned());
    }
    out.join(" ")
}

#[cfg(test)]
#[path = "trace_tests.rs"]
mod tests;
