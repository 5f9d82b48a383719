// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Instant;

use parking_lot::Mutex;

/// Per-socket token bucket for inbound consumer frames.
///
/// Refills continuously; `try_acquire` never blocks. A fresh bucket starts
/// full so short bursts right after connect are fine.
#[derive(Debug)]
pub struct TokenBucket {
    inner: Mutex<BucketInner>,
    capacity: f64,
    refill_per_sec: f64,
}

#[derive(Debug)]
struct BucketInner {
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            inner: Mutex::new(BucketInner { tokens: f64::from(capacity), last: Instant::now() }),
            capacity: f64::from(capacity),
            refill_per_sec,
        }
    }

    /// Take one token if available.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(inner.last).as_secs_f64();
        inner.last = now;
        inner.tokens = (inner.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        if inner.tokens >= 1.0 {
            inner.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
#[path = "rate_tests.rs"]
mod tests;
