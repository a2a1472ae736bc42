//! Conformance suite for [`StorageBackend`] implementations.
//!
//! The ticket registries rely on a handful of backend guarantees: expired keys
//! are invisible, compare-and-set is atomic and carries a TTL, ranges come
//! back ordered, and transactions are all-or-nothing. Each function here pins
//! one of those guarantees so any backend can be checked against them.
//!
//! # Usage
//!
//! ```no_run
//! use ticketd_storage::{MemoryBackend, conformance};
//!
//! #[tokio::test]
//! async fn crud_get_returns_none_for_missing_key() {
//!     conformance::crud_get_returns_none_for_missing_key(&MemoryBackend::new()).await;
//! }
//! ```
//!
//! TTL checks sleep on the tokio clock; run them under
//! `#[tokio::test(start_paused = true)]` to keep them instant.
//!
//! | Category | Contract aspect |
//! |----------|-----------------|
//! | CRUD | Basic get/set/delete semantics |
//! | Range | Ordering, bounds, prefix scans |
//! | TTL | Expiry hides keys, CAS carries TTL |
//! | CAS | Preconditions and single-winner races |
//! | Transaction | Atomic commit, read-your-writes |

use std::{ops::Bound, sync::Arc, time::Duration};

use bytes::Bytes;

use crate::{assert_conflict, backend::StorageBackend, types::prefix_end};

// ============================================================================
// CRUD
// ============================================================================

/// `get` on a nonexistent key returns `Ok(None)`.
pub async fn crud_get_returns_none_for_missing_key<B: StorageBackend>(backend: &B) {
    let result = backend.get(b"nonexistent").await;
    assert!(matches!(result, Ok(None)), "missing key should return Ok(None): {result:?}");
}

/// `set` overwrites, `delete` removes, and deleting twice is harmless.
pub async fn crud_set_overwrite_delete<B: StorageBackend>(backend: &B) {
    backend.set(b"k1".to_vec(), b"original".to_vec()).await.expect("set");
    backend.set(b"k1".to_vec(), b"updated".to_vec()).await.expect("overwrite");
    assert_eq!(backend.get(b"k1").await.expect("get"), Some(Bytes::from("updated")));

    backend.delete(b"k1").await.expect("delete");
    backend.delete(b"k1").await.expect("second delete is a no-op");
    assert_eq!(backend.get(b"k1").await.expect("get after delete"), None);
}

/// Keys are byte-level distinct: `"key"` and `"key\x00"` never collide.
pub async fn crud_keys_are_byte_distinct<B: StorageBackend>(backend: &B) {
    backend.set(b"key".to_vec(), b"a".to_vec()).await.expect("set key");
    backend.set(b"key\x00".to_vec(), b"b".to_vec()).await.expect("set key+null");
    assert_eq!(backend.get(b"key").await.expect("get"), Some(Bytes::from("a")));
    assert_eq!(backend.get(b"key\x00").await.expect("get"), Some(Bytes::from("b")));
}

// ============================================================================
// Range
// ============================================================================

/// `get_range` returns results in key order.
pub async fn range_results_are_ordered<B: StorageBackend>(backend: &B) {
    for key in [b"r:c", b"r:a", b"r:b"] {
        backend.set(key.to_vec(), b"v".to_vec()).await.expect("set");
    }
    let results = backend.get_range(b"r:".to_vec()..b"r:~".to_vec()).await.expect("get_range");
    let keys: Vec<&[u8]> = results.iter().map(|kv| kv.key.as_ref()).collect();
    assert_eq!(keys, vec![b"r:a".as_slice(), b"r:b", b"r:c"], "range results must be sorted");
}

/// A prefix scan built with [`prefix_end`] sees exactly the prefixed keys.
pub async fn range_prefix_scan_is_exact<B: StorageBackend>(backend: &B) {
    for key in [b"idx/a/1".as_slice(), b"idx/a/2", b"idx/b/1", b"idx/a", b"idx/a0"] {
        backend.set(key.to_vec(), b"v".to_vec()).await.expect("set");
    }
    let prefix = b"idx/a/".to_vec();
    let end = prefix_end(&prefix).expect("prefix has an end");
    let results = backend.get_range(prefix..end).await.expect("get_range");
    let keys: Vec<&[u8]> = results.iter().map(|kv| kv.key.as_ref()).collect();
    assert_eq!(keys, vec![b"idx/a/1".as_slice(), b"idx/a/2"]);
}

/// `get_range_limited` returns one ordered page and resumes after the last key.
pub async fn range_limited_pages_in_order<B: StorageBackend>(backend: &B) {
    for i in 0..7 {
        backend.set(format!("p:{i}").into_bytes(), b"v".to_vec()).await.expect("set");
    }
    backend.set(b"q:outside".to_vec(), b"v".to_vec()).await.expect("set");

    let end = Bound::Excluded(b"p;".to_vec());
    let mut start = Bound::Included(b"p:".to_vec());
    let mut pages = Vec::new();
    loop {
        let page = backend
            .get_range_limited((start.clone(), end.clone()), 3)
            .await
            .expect("get_range_limited");
        assert!(page.len() <= 3, "page exceeded its limit: {}", page.len());
        let Some(last) = page.last() else { break };
        start = Bound::Excluded(last.key.to_vec());
        pages.push(page.iter().map(|kv| kv.key.clone()).collect::<Vec<_>>());
    }

    let sizes: Vec<usize> = pages.iter().map(Vec::len).collect();
    assert_eq!(sizes, vec![3, 3, 1]);
    let keys: Vec<Bytes> = pages.into_iter().flatten().collect();
    let expected: Vec<Bytes> = (0..7).map(|i| Bytes::from(format!("p:{i}"))).collect();
    assert_eq!(keys, expected);

    let none = backend.get_range_limited(b"p:".to_vec()..b"p;".to_vec(), 0).await.expect("limit 0");
    assert!(none.is_empty());
}

/// `clear_range` removes keys in `[start, end)` and leaves the rest.
pub async fn range_clear_is_half_open<B: StorageBackend>(backend: &B) {
    for key in [b"c:1", b"c:2", b"c:3"] {
        backend.set(key.to_vec(), b"v".to_vec()).await.expect("set");
    }
    backend.clear_range(b"c:1".to_vec()..b"c:3".to_vec()).await.expect("clear_range");
    assert_eq!(backend.get(b"c:1").await.expect("get"), None);
    assert_eq!(backend.get(b"c:2").await.expect("get"), None);
    assert!(backend.get(b"c:3").await.expect("get").is_some(), "end bound is exclusive");
}

// ============================================================================
// TTL
// ============================================================================

/// A key written with a TTL disappears from `get` and `get_range` once it elapses.
pub async fn ttl_expired_key_is_invisible<B: StorageBackend>(backend: &B) {
    backend
        .set_with_ttl(b"t:short".to_vec(), b"v".to_vec(), Duration::from_millis(100))
        .await
        .expect("set_with_ttl");
    backend
        .set_with_ttl(b"t:long".to_vec(), b"v".to_vec(), Duration::from_secs(3600))
        .await
        .expect("set_with_ttl");
    assert!(backend.get(b"t:short").await.expect("get").is_some());

    tokio::time::sleep(Duration::from_millis(250)).await;

    assert_eq!(backend.get(b"t:short").await.expect("get"), None);
    let live = backend.get_range(b"t:".to_vec()..b"t;".to_vec()).await.expect("get_range");
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].key, Bytes::from("t:long"));
}

/// `set` without TTL replaces an earlier TTL.
pub async fn ttl_plain_set_clears_ttl<B: StorageBackend>(backend: &B) {
    backend
        .set_with_ttl(b"t:k".to_vec(), b"temp".to_vec(), Duration::from_millis(100))
        .await
        .expect("set_with_ttl");
    backend.set(b"t:k".to_vec(), b"permanent".to_vec()).await.expect("set");

    tokio::time::sleep(Duration::from_millis(250)).await;

    assert_eq!(backend.get(b"t:k").await.expect("get"), Some(Bytes::from("permanent")));
}

/// `compare_and_set` installs the TTL it is given.
pub async fn ttl_cas_carries_ttl<B: StorageBackend>(backend: &B) {
    backend.set(b"t:cas".to_vec(), b"v1".to_vec()).await.expect("set");
    backend
        .compare_and_set(b"t:cas", Some(b"v1"), b"v2".to_vec(), Some(Duration::from_millis(100)))
        .await
        .expect("cas");
    assert_eq!(backend.get(b"t:cas").await.expect("get"), Some(Bytes::from("v2")));

    tokio::time::sleep(Duration::from_millis(250)).await;

    assert_eq!(backend.get(b"t:cas").await.expect("get"), None);
}

// ============================================================================
// CAS
// ============================================================================

/// Insert-if-absent succeeds once and conflicts afterwards.
pub async fn cas_insert_if_absent<B: StorageBackend>(backend: &B) {
    backend.compare_and_set(b"lock", None, b"holder-1".to_vec(), None).await.expect("first");
    assert_conflict!(backend.compare_and_set(b"lock", None, b"holder-2".to_vec(), None).await);
    assert_eq!(backend.get(b"lock").await.expect("get"), Some(Bytes::from("holder-1")));
}

/// Update-if-unchanged conflicts on stale or missing values.
pub async fn cas_update_requires_exact_match<B: StorageBackend>(backend: &B) {
    backend.set(b"ver".to_vec(), b"1".to_vec()).await.expect("set");
    assert_conflict!(backend.compare_and_set(b"ver", Some(b"0"), b"2".to_vec(), None).await);
    assert_conflict!(backend.compare_and_set(b"ver", Some(b"1\x00"), b"2".to_vec(), None).await);
    assert_conflict!(backend.compare_and_set(b"gone", Some(b"1"), b"2".to_vec(), None).await);

    backend.compare_and_set(b"ver", Some(b"1"), b"2".to_vec(), None).await.expect("match");
    assert_eq!(backend.get(b"ver").await.expect("get"), Some(Bytes::from("2")));
}

/// Concurrent CAS attempts from the same expected value produce one winner.
pub async fn cas_concurrent_single_winner<B: StorageBackend + 'static>(backend: Arc<B>) {
    backend.set(b"race".to_vec(), b"start".to_vec()).await.expect("set");

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..16 {
        let backend = Arc::clone(&backend);
        tasks.spawn(async move {
            backend
                .compare_and_set(b"race", Some(b"start"), format!("winner-{i}").into_bytes(), None)
                .await
                .is_ok()
        });
    }

    let mut winners = 0;
    while let Some(result) = tasks.join_next().await {
        if result.expect("task should not panic") {
            winners += 1;
        }
    }
    assert_eq!(winners, 1, "exactly one CAS should win");
}

// ============================================================================
// Transaction
// ============================================================================

/// A committed transaction applies every write; reads see pending writes.
pub async fn txn_commit_applies_all<B: StorageBackend>(backend: &B) {
    backend.set(b"x:old".to_vec(), b"v".to_vec()).await.expect("set");

    let mut txn = backend.transaction().await.expect("begin");
    txn.set(b"x:a".to_vec(), b"1".to_vec());
    txn.set(b"x:b".to_vec(), b"2".to_vec());
    txn.delete(b"x:old".to_vec());
    assert_eq!(txn.get(b"x:a").await.expect("txn get"), Some(Bytes::from("1")));
    assert_eq!(txn.get(b"x:old").await.expect("txn get"), None);
    txn.commit().await.expect("commit");

    assert_eq!(backend.get(b"x:a").await.expect("get"), Some(Bytes::from("1")));
    assert_eq!(backend.get(b"x:b").await.expect("get"), Some(Bytes::from("2")));
    assert_eq!(backend.get(b"x:old").await.expect("get"), None);
}

/// A dropped transaction applies nothing.
pub async fn txn_drop_discards_writes<B: StorageBackend>(backend: &B) {
    {
        let mut txn = backend.transaction().await.expect("begin");
        txn.set(b"x:dropped".to_vec(), b"1".to_vec());
    }
    assert_eq!(backend.get(b"x:dropped").await.expect("get"), None);
}

/// A failed CAS precondition rejects the whole transaction.
pub async fn txn_cas_failure_is_atomic<B: StorageBackend>(backend: &B) {
    backend.set(b"x:guard".to_vec(), b"v1".to_vec()).await.expect("set");

    let mut txn = backend.transaction().await.expect("begin");
    txn.compare_and_set(b"x:guard".to_vec(), Some(b"other".to_vec()), b"v2".to_vec())
        .expect("buffer cas");
    txn.set(b"x:side".to_vec(), b"effect".to_vec());
    assert_conflict!(txn.commit().await);

    assert_eq!(backend.get(b"x:guard").await.expect("get"), Some(Bytes::from("v1")));
    assert_eq!(backend.get(b"x:side").await.expect("get"), None);
}

/// A buffered compare-and-set guards a deletion of the same key.
pub async fn txn_cas_guards_delete<B: StorageBackend>(backend: &B) {
    backend.set(b"x:lock".to_vec(), b"node-a".to_vec()).await.expect("set");

    let mut txn = backend.transaction().await.expect("begin");
    txn.compare_and_set(b"x:lock".to_vec(), Some(b"node-b".to_vec()), b"node-b".to_vec())
        .expect("buffer cas");
    txn.delete(b"x:lock".to_vec());
    let refused = txn.commit().await;
    assert_conflict!(refused);
    assert_eq!(backend.get(b"x:lock").await.expect("get"), Some(Bytes::from("node-a")));

    let mut txn = backend.transaction().await.expect("begin");
    txn.compare_and_set(b"x:lock".to_vec(), Some(b"node-a".to_vec()), b"node-a".to_vec())
        .expect("buffer cas");
    txn.delete(b"x:lock".to_vec());
    txn.commit().await.expect("guarded delete");
    assert_eq!(backend.get(b"x:lock").await.expect("get"), None);
}

/// A reachable backend reports healthy, with or without data.
pub async fn health_check_reports_ready<B: StorageBackend>(backend: &B) {
    backend.health_check().await.expect("empty backend is healthy");
    backend.set(b"h:key".to_vec(), b"v".to_vec()).await.expect("set");
    backend.health_check().await.expect("populated backend is healthy");
}
