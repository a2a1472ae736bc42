//! Storage backend trait definition.
//!
//! [`StorageBackend`] is the byte-level key/value contract that the distributed
//! ticket registries sit on. A registry decides how tickets map to keys; the
//! backend only promises ordered keys, atomic compare-and-set, native key
//! expiry and multi-key transactions.
//!
//! # Implementing a Backend
//!
//! 1. Implement the [`StorageBackend`] trait
//! 2. Implement a corresponding [`Transaction`] type
//! 3. Map backend-specific errors to [`StorageError`](crate::StorageError)
//! 4. Run the [`conformance`](crate::conformance) suite against it
//!
//! See [`MemoryBackend`](crate::MemoryBackend) for a reference implementation.

use std::{ops::RangeBounds, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;

use crate::{error::StorageResult, transaction::Transaction, types::KeyValue};

/// Abstract storage backend for key-value operations.
///
/// Backends are expected to be thread-safe (`Send + Sync`) and support
/// concurrent operations from many tasks.
///
/// | Method | Description |
/// |--------|-------------|
/// | [`get`](StorageBackend::get) | Retrieve a single value by key |
/// | [`set`](StorageBackend::set) | Store a key-value pair without expiry |
/// | [`set_with_ttl`](StorageBackend::set_with_ttl) | Store with automatic expiration |
/// | [`compare_and_set`](StorageBackend::compare_and_set) | Atomic compare-and-swap |
/// | [`delete`](StorageBackend::delete) | Remove a key |
/// | [`get_range`](StorageBackend::get_range) | Retrieve keys in a range, in order |
/// | [`get_range_limited`](StorageBackend::get_range_limited) | Retrieve one bounded page of a range |
/// | [`clear_range`](StorageBackend::clear_range) | Delete keys in a range |
/// | [`transaction`](StorageBackend::transaction) | Begin an atomic transaction |
/// | [`health_check`](StorageBackend::health_check) | Verify backend availability |
///
/// # Example
///
/// ```
/// use bytes::Bytes;
/// use ticketd_storage::{MemoryBackend, StorageBackend};
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let backend = MemoryBackend::new();
///
/// backend.set(b"key".to_vec(), b"value".to_vec()).await.unwrap();
/// let value = backend.get(b"key").await.unwrap();
/// assert_eq!(value, Some(Bytes::from("value")));
/// # });
/// ```
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Retrieves a value by key.
    ///
    /// Returns `Ok(None)` when the key is absent or its TTL has elapsed.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>>;

    /// Stores a key-value pair, overwriting any previous value and TTL.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()>;

    /// Stores a key-value pair that the backend removes once `ttl` elapses.
    ///
    /// An expired key is invisible to every read even before any background
    /// sweep physically removes it.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn set_with_ttl(&self, key: Vec<u8>, value: Vec<u8>, ttl: Duration) -> StorageResult<()>;

    /// Atomically replaces a key's value if it matches the expected current value.
    ///
    /// - **`expected: None`**: insert-if-absent. Fails with
    ///   [`Conflict`](crate::StorageError::Conflict) if any live value is present.
    /// - **`expected: Some(value)`**: update-if-unchanged. Fails with
    ///   [`Conflict`](crate::StorageError::Conflict) if the key is absent, expired,
    ///   or holds different bytes.
    ///
    /// On success the stored value becomes `new_value` and the key's expiry is
    /// replaced by `ttl` (`None` makes the key non-expiring). Ticket registries
    /// pass the ticket's remaining lifetime here so that a read-modify-write
    /// does not extend or drop the native expiry.
    ///
    /// The comparison is exact and length-sensitive. Callers that serialize
    /// structured data must serialize deterministically.
    ///
    /// # Retry Pattern
    ///
    /// ```no_run
    /// use ticketd_storage::{MemoryBackend, StorageBackend, StorageError};
    ///
    /// async fn increment(backend: &MemoryBackend, key: &[u8]) -> Result<(), StorageError> {
    ///     loop {
    ///         let current = backend.get(key).await?;
    ///         let (expected, next) = match current {
    ///             Some(bytes) => {
    ///                 let n: u64 = String::from_utf8_lossy(&bytes).parse().unwrap_or(0);
    ///                 (Some(bytes.to_vec()), (n + 1).to_string().into_bytes())
    ///             },
    ///             None => (None, b"1".to_vec()),
    ///         };
    ///         match backend.compare_and_set(key, expected.as_deref(), next, None).await {
    ///             Ok(()) => return Ok(()),
    ///             Err(StorageError::Conflict) => continue,
    ///             Err(e) => return Err(e),
    ///         }
    ///     }
    /// }
    /// ```
    #[must_use = "compare-and-set may fail with a conflict and errors must be handled"]
    async fn compare_and_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> StorageResult<()>;

    /// Deletes a key. Deleting an absent key is a no-op.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn delete(&self, key: &[u8]) -> StorageResult<()>;

    /// Retrieves all live key-value pairs within a range, in key order.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn get_range<R>(&self, range: R) -> StorageResult<Vec<KeyValue>>
    where
        R: RangeBounds<Vec<u8>> + Send;

    /// Retrieves at most `limit` live key-value pairs within a range, in key
    /// order, starting from the lower bound.
    ///
    /// Paginating callers resume with an excluded lower bound at the last key
    /// returned. Implementations must stop reading once `limit` live entries
    /// are collected rather than fetching the rest of the range.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn get_range_limited<R>(&self, range: R, limit: usize) -> StorageResult<Vec<KeyValue>>
    where
        R: RangeBounds<Vec<u8>> + Send;

    /// Deletes all keys within a range.
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn clear_range<R>(&self, range: R) -> StorageResult<()>
    where
        R: RangeBounds<Vec<u8>> + Send;

    /// Begins a new transaction.
    ///
    /// Writes are buffered in the returned handle and applied atomically on
    /// [`Transaction::commit`].
    #[must_use = "storage operations may fail and errors must be handled"]
    async fn transaction(&self) -> StorageResult<Box<dyn Transaction>>;

    /// Verifies that the backend can serve requests.
    #[must_use = "health check results indicate backend availability and must be inspected"]
    async fn health_check(&self) -> StorageResult<()>;
}
