//! Concurrent access stress tests for `MemoryBackend`.
//!
//! Ignored by default:
//!
//! ```bash
//! cargo test -p ticketd-storage --test concurrent_stress -- --ignored
//! ```

#![allow(clippy::expect_used, clippy::panic)]

use std::sync::Arc;

use ticketd_storage::{MemoryBackend, StorageBackend, StorageError, testutil::make_key};
use tokio::task::JoinSet;

const CONCURRENCY: usize = 16;
const CAS_ROUNDS: usize = 50;

/// Every round of racing CAS increments produces exactly one winner, so the
/// counter ends at the number of rounds.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn cas_rounds_have_one_winner_each() {
    let backend = Arc::new(MemoryBackend::new());
    backend.set(b"counter".to_vec(), b"0".to_vec()).await.expect("seed");

    for round in 0..CAS_ROUNDS {
        let expected = round.to_string().into_bytes();
        let next = (round + 1).to_string().into_bytes();

        let mut tasks = JoinSet::new();
        for _ in 0..CONCURRENCY {
            let backend = Arc::clone(&backend);
            let expected = expected.clone();
            let next = next.clone();
            tasks.spawn(async move {
                backend.compare_and_set(b"counter", Some(&expected), next, None).await
            });
        }

        let mut winners = 0;
        while let Some(result) = tasks.join_next().await {
            match result.expect("join") {
                Ok(()) => winners += 1,
                Err(StorageError::Conflict) => {},
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }
        assert_eq!(winners, 1, "round {round} should have exactly one winner");
    }

    let last = backend.get(b"counter").await.expect("get").expect("present");
    assert_eq!(&last[..], CAS_ROUNDS.to_string().as_bytes());
}

/// Disjoint writers never lose each other's keys.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn parallel_writers_disjoint_keys() {
    let backend = Arc::new(MemoryBackend::new());

    let mut tasks = JoinSet::new();
    for task in 0..CONCURRENCY {
        let backend = Arc::clone(&backend);
        tasks.spawn(async move {
            for i in 0..100 {
                backend
                    .set(make_key(&format!("t{task:02}"), i), b"v".to_vec())
                    .await
                    .expect("set");
            }
        });
    }
    while tasks.join_next().await.is_some() {}

    let all = backend.get_range(b"t".to_vec()..b"u".to_vec()).await.expect("range");
    assert_eq!(all.len(), CONCURRENCY * 100);
}
