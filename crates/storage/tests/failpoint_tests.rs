#![allow(clippy::expect_used, clippy::panic)]
//! Integration tests for fail-point injection.
//!
//! These tests require the `failpoints` feature:
//! ```bash
//! cargo test -p perimeter-storage --features failpoints --test failpoint_tests
//! ```
#![cfg(feature = "failpoints")]

use std::sync::Arc;

use perimeter_storage::{BatchConfig, BatchEntry, MemoryBackend, WriteBatcher};

#[tokio::test]
async fn batch_write_failpoint_returns_error() {
    let scenario = fail::FailScenario::setup();
    fail::cfg("batch-before-write", "return").expect("failed to configure fail point");

    let backend = Arc::new(MemoryBackend::new());
    let batcher = WriteBatcher::new("test", backend.clone(), BatchConfig::default());
    batcher.enqueue(BatchEntry::persistent("key", b"value".to_vec()));

    assert!(batcher.flush().await.is_err(), "flush should fail when fail point is active");
    assert!(backend.is_empty());

    scenario.teardown();
}

#[tokio::test]
async fn background_flush_survives_failpoint() {
    let scenario = fail::FailScenario::setup();
    fail::cfg("batch-before-write", "return").expect("failed to configure fail point");

    let backend = Arc::new(MemoryBackend::new());
    let config = BatchConfig::builder().max_batch_size(1).build().expect("valid config");
    let batcher = WriteBatcher::new("test", backend.clone(), config);

    let handle = batcher.enqueue(BatchEntry::persistent("key", b"value".to_vec()));
    handle.expect("flush spawned").await.expect("flush task must not panic");
    assert!(backend.is_empty());

    scenario.teardown();
}

#[tokio::test]
async fn batch_write_without_failpoint_succeeds() {
    let scenario = fail::FailScenario::setup();

    let backend = Arc::new(MemoryBackend::new());
    let batcher = WriteBatcher::new("test", backend.clone(), BatchConfig::default());
    batcher.enqueue(BatchEntry::persistent("key", b"value".to_vec()));

    let stats = batcher.flush().await.expect("flush should succeed without fail point");
    assert_eq!(stats.entries_count, 1);

    scenario.teardown();
}
