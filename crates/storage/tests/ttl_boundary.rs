//! TTL boundary conditions for `MemoryBackend`.
//!
//! All tests run on a paused tokio clock so deadlines are exact.

#![allow(clippy::expect_used, clippy::panic)]

use std::time::Duration;

use bytes::Bytes;
use ticketd_storage::{MemoryBackend, StorageBackend};

fn backend() -> MemoryBackend {
    MemoryBackend::with_sweep_interval(Duration::from_secs(3600))
}

/// A zero TTL expires at the instant it is written.
#[tokio::test(start_paused = true)]
async fn zero_ttl_is_immediately_expired() {
    let backend = backend();
    backend.set_with_ttl(b"zero".to_vec(), b"v".to_vec(), Duration::ZERO).await.expect("set");

    assert_eq!(backend.get(b"zero").await.expect("get"), None);
    assert!(backend.get_range(b"z".to_vec()..b"{".to_vec()).await.expect("range").is_empty());
}

/// The deadline is exclusive: the key is gone exactly at `now + ttl`.
#[tokio::test(start_paused = true)]
async fn key_expires_exactly_at_deadline() {
    let backend = backend();
    backend
        .set_with_ttl(b"edge".to_vec(), b"v".to_vec(), Duration::from_secs(10))
        .await
        .expect("set");

    tokio::time::advance(Duration::from_millis(9_999)).await;
    assert!(backend.get(b"edge").await.expect("get").is_some());

    tokio::time::advance(Duration::from_millis(1)).await;
    assert_eq!(backend.get(b"edge").await.expect("get"), None);
}

/// A TTL too large to represent never expires instead of overflowing.
#[tokio::test(start_paused = true)]
async fn huge_ttl_never_expires() {
    let backend = backend();
    backend.set_with_ttl(b"forever".to_vec(), b"v".to_vec(), Duration::MAX).await.expect("set");

    tokio::time::advance(Duration::from_secs(86_400 * 365)).await;
    assert_eq!(backend.get(b"forever").await.expect("get"), Some(Bytes::from("v")));
}

/// Re-setting with a new TTL replaces the old deadline.
#[tokio::test(start_paused = true)]
async fn set_with_ttl_replaces_deadline() {
    let backend = backend();
    backend
        .set_with_ttl(b"k".to_vec(), b"v1".to_vec(), Duration::from_secs(5))
        .await
        .expect("set");
    backend
        .set_with_ttl(b"k".to_vec(), b"v2".to_vec(), Duration::from_secs(60))
        .await
        .expect("reset");

    tokio::time::advance(Duration::from_secs(30)).await;
    assert_eq!(backend.get(b"k").await.expect("get"), Some(Bytes::from("v2")));
}
