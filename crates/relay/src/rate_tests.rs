// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn fresh_bucket_allows_burst_up_to_capacity() {
    let bucket = TokenBucket::new(5, 1.0);
    for _ in 0..5 {
        assert!(bucket.try_acquire());
    }
    assert!(!bucket.try_acquire());
}

#[test]
fn refills_over_time() {
    let bucket = TokenBucket::new(2, 1000.0);
    assert!(bucket.try_acquire());
    assert!(bucket.try_acquire());
    assert!(!bucket.try_acquire());
    std::thread::sleep(std::time::Duration::from_millis(5));
    assert!(bucket.try_acquire());
}

#[test]
fn never_exceeds_capacity() {
    let bucket = TokenBucket::new(3, 1000.0);
    std::thread::sleep(std::time::Duration::from_millis(10));
    for _ in 0..3 {
        assert!(bucket.try_acquire());
    }
    assert!(!bucket.try_acquire());
}
