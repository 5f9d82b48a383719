// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire-format framing and parsing shared by the backend adapters.

pub mod jsonrpc;
pub mod ndjson;
pub mod sse;

pub use jsonrpc::{JsonRpcCodec, JsonRpcError, JsonRpcMessage};
pub use ndjson::NdjsonParser;
pub use sse::{SseEvent, SseParser};
