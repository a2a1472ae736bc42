//! Transaction trait for atomic storage operations.
//!
//! Document-style ticket registries write a ticket record together with its
//! index entries; a [`Transaction`] makes that group of writes land together
//! or not at all.
//!
//! # Example
//!
//! ```
//! use ticketd_storage::{MemoryBackend, StorageBackend};
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let backend = MemoryBackend::new();
//!
//! let mut txn = backend.transaction().await.unwrap();
//! txn.set(b"tickets/tgt/abc".to_vec(), b"{}".to_vec());
//! txn.set(b"idx/principal/casuser/abc".to_vec(), b"tgt".to_vec());
//! txn.commit().await.unwrap();
//!
//! assert!(backend.get(b"idx/principal/casuser/abc").await.unwrap().is_some());
//! # });
//! ```

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::StorageResult;

/// Transaction handle for atomic multi-operation commits.
///
/// Writes are buffered until [`commit`](Transaction::commit). Reads through
/// [`get`](Transaction::get) see the transaction's own pending writes first.
#[async_trait]
pub trait Transaction: Send {
    /// Reads a key, preferring this transaction's pending writes.
    ///
    /// Returns `Ok(None)` if the key is absent or was deleted in this
    /// transaction.
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>>;

    /// Buffers a write of `value` to `key`.
    fn set(&mut self, key: Vec<u8>, value: Vec<u8>);

    /// Buffers a deletion of `key`.
    fn delete(&mut self, key: Vec<u8>);

    /// Buffers a conditional write evaluated at commit time.
    ///
    /// If the stored value does not equal `expected` when the transaction
    /// commits (`None` meaning "absent"), the whole commit fails with
    /// [`StorageError::Conflict`](crate::StorageError::Conflict) and nothing
    /// is applied.
    ///
    /// Preconditions are checked before any buffered write lands, and plain
    /// `set`/`delete` calls apply after the conditional writes. A
    /// compare-and-set followed by a `delete` of the same key is therefore a
    /// guarded deletion.
    fn compare_and_set(
        &mut self,
        key: Vec<u8>,
        expected: Option<Vec<u8>>,
        new_value: Vec<u8>,
    ) -> StorageResult<()>;

    /// Applies every buffered operation atomically, consuming the handle.
    ///
    /// # Errors
    ///
    /// - [`StorageError::Conflict`](crate::StorageError::Conflict) if a buffered
    ///   compare-and-set precondition no longer holds
    /// - Other [`StorageError`](crate::StorageError) variants on backend failures
    async fn commit(self: Box<Self>) -> StorageResult<()>;
}
