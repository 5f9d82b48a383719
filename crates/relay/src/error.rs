// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde::{Deserialize, Serialize};
use std::fmt;

/// Typed error taxonomy shared across the gateway.
///
/// Message-pump loops swallow per-message errors and keep going; transport
/// failures end a session's stream; everything else is surfaced through the
/// event bus, never panicked on.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("storage: {0}")]
    Storage(String),

    #[error("process: {0}")]
    Process(String),

    #[error("connection: {0}")]
    Connection(String),

    #[error("protocol: {0}")]
    Protocol(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("session closed")]
    SessionClosed,

    #[error("rate limited")]
    RateLimit,

    #[error("payload too large: {size} bytes (limit {limit})")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("no adapter: {0}")]
    NoAdapter(String),
}

impl Error {
    pub fn storage(e: impl fmt::Display) -> Self {
        Self::Storage(e.to_string())
    }

    pub fn process(e: impl fmt::Display) -> Self {
        Self::Process(e.to_string())
    }

    pub fn connection(e: impl fmt::Display) -> Self {
        Self::Connection(e.to_string())
    }

    pub fn protocol(e: impl fmt::Display) -> Self {
        Self::Protocol(e.to_string())
    }

    pub fn auth(e: impl fmt::Display) -> Self {
        Self::Auth(e.to_string())
    }

    /// Stable wire-facing code for error frames and logs.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Storage(_) => ErrorCode::Storage,
            Self::Process(_) => ErrorCode::Process,
            Self::Connection(_) => ErrorCode::Connection,
            Self::Protocol(_) => ErrorCode::Protocol,
            Self::Auth(_) => ErrorCode::Unauthorized,
            Self::SessionClosed => ErrorCode::SessionClosed,
            Self::RateLimit => ErrorCode::RateLimited,
            Self::PayloadTooLarge { .. } => ErrorCode::PayloadTooLarge,
            Self::NoAdapter(_) => ErrorCode::NoAdapter,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Unified error codes shared across the consumer WS protocol and the
/// control API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    Storage,
    Process,
    Connection,
    Protocol,
    Unauthorized,
    SessionClosed,
    RateLimited,
    PayloadTooLarge,
    NoAdapter,
    BadRequest,
    NotFound,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Storage => "STORAGE",
            Self::Process => "PROCESS",
            Self::Connection => "CONNECTION",
            Self::Protocol => "PROTOCOL",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::SessionClosed => "SESSION_CLOSED",
            Self::RateLimited => "RATE_LIMITED",
            Self::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            Self::NoAdapter => "NO_ADAPTER",
            Self::BadRequest => "BAD_REQUEST",
            Self::NotFound => "NOT_FOUND",
            Self::Internal => "INTERNAL",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::Storage | Self::Process | Self::Connection | Self::Internal => 500,
            Self::Protocol | Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::SessionClosed | Self::NotFound => 404,
            Self::RateLimited => 429,
            Self::PayloadTooLarge => 413,
            Self::NoAdapter => 404,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// WebSocket close codes used by the consumer protocol.
pub mod close {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Policy violation: malformed session id or disallowed origin.
    pub const POLICY: u16 = 1008;
    /// Frame exceeded the inbound size cap.
    pub const TOO_BIG: u16 = 1009;
    /// Authentication failed.
    pub const AUTH_FAILED: u16 = 4401;
    /// Session not found.
    pub const NOT_FOUND: u16 = 4404;
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
