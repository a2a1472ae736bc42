//! Runs the backend conformance suite against `MemoryBackend`.

#![allow(clippy::expect_used, clippy::panic)]

use std::sync::Arc;

use ticketd_storage::{MemoryBackend, conformance};

#[tokio::test]
async fn crud_get_returns_none_for_missing_key() {
    conformance::crud_get_returns_none_for_missing_key(&MemoryBackend::new()).await;
}

#[tokio::test]
async fn crud_set_overwrite_delete() {
    conformance::crud_set_overwrite_delete(&MemoryBackend::new()).await;
}

#[tokio::test]
async fn crud_keys_are_byte_distinct() {
    conformance::crud_keys_are_byte_distinct(&MemoryBackend::new()).await;
}

#[tokio::test]
async fn range_results_are_ordered() {
    conformance::range_results_are_ordered(&MemoryBackend::new()).await;
}

#[tokio::test]
async fn range_prefix_scan_is_exact() {
    conformance::range_prefix_scan_is_exact(&MemoryBackend::new()).await;
}

#[tokio::test]
async fn range_limited_pages_in_order() {
    conformance::range_limited_pages_in_order(&MemoryBackend::new()).await;
}

#[tokio::test]
async fn range_clear_is_half_open() {
    conformance::range_clear_is_half_open(&MemoryBackend::new()).await;
}

#[tokio::test(start_paused = true)]
async fn ttl_expired_key_is_invisible() {
    conformance::ttl_expired_key_is_invisible(&MemoryBackend::new()).await;
}

#[tokio::test(start_paused = true)]
async fn ttl_plain_set_clears_ttl() {
    conformance::ttl_plain_set_clears_ttl(&MemoryBackend::new()).await;
}

#[tokio::test(start_paused = true)]
async fn ttl_cas_carries_ttl() {
    conformance::ttl_cas_carries_ttl(&MemoryBackend::new()).await;
}

#[tokio::test]
async fn cas_insert_if_absent() {
    conformance::cas_insert_if_absent(&MemoryBackend::new()).await;
}

#[tokio::test]
async fn cas_update_requires_exact_match() {
    conformance::cas_update_requires_exact_match(&MemoryBackend::new()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cas_concurrent_single_winner() {
    conformance::cas_concurrent_single_winner(Arc::new(MemoryBackend::new())).await;
}

#[tokio::test]
async fn txn_commit_applies_all() {
    conformance::txn_commit_applies_all(&MemoryBackend::new()).await;
}

#[tokio::test]
async fn txn_drop_discards_writes() {
    conformance::txn_drop_discards_writes(&MemoryBackend::new()).await;
}

#[tokio::test]
async fn txn_cas_failure_is_atomic() {
    conformance::txn_cas_failure_is_atomic(&MemoryBackend::new()).await;
}

#[tokio::test]
async fn txn_cas_guards_delete() {
    conformance::txn_cas_guards_delete(&MemoryBackend::new()).await;
}

#[tokio::test]
async fn health_check_reports_ready() {
    conformance::health_check_reports_ready(&MemoryBackend::new()).await;
}
