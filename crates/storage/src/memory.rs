//! In-memory storage backend implementation.
//!
//! [`MemoryBackend`] keeps every entry in a single ordered map guarded by a
//! [`parking_lot::RwLock`]. Each entry carries its own optional deadline, so
//! expiry checks and writes never need to coordinate two maps.
//!
//! Deadlines use [`tokio::time::Instant`], which lets tests drive expiry with
//! a paused runtime clock instead of sleeping.
//!
//! # Example
//!
//! ```
//! use ticketd_storage::{MemoryBackend, StorageBackend};
//!
//! #[tokio::main]
//! async fn main() {
//!     let backend = MemoryBackend::new();
//!
//!     backend.set(b"greeting".to_vec(), b"hello".to_vec()).await.unwrap();
//!     let value = backend.get(b"greeting").await.unwrap();
//!
//!     assert_eq!(value.unwrap().as_ref(), b"hello");
//! }
//! ```
//!
//! # Limitations
//!
//! - Data is not persisted; all data is lost when the process exits
//! - Expired entries are hidden immediately but only reclaimed by the sweeper

use std::{
    collections::BTreeMap,
    ops::{Bound, RangeBounds},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::{
    select,
    sync::watch,
    time::{Instant, sleep},
};

use crate::{
    backend::StorageBackend,
    error::{StorageError, StorageResult},
    transaction::Transaction,
    types::KeyValue,
};

/// Interval between sweeps of expired entries.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
struct Entry {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|deadline| deadline > now)
    }
}

type Store = BTreeMap<Vec<u8>, Entry>;

/// Holds the shutdown signal sender. Dropping it wakes the sweeper, which
/// then exits.
struct ShutdownGuard {
    shutdown_tx: watch::Sender<()>,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// In-memory storage backend.
///
/// Clones share the same data. The background sweeper stops when the last
/// clone is dropped or [`shutdown`](Self::shutdown) is called.
#[derive(Clone)]
pub struct MemoryBackend {
    data: Arc<RwLock<Store>>,
    shutdown_guard: Arc<ShutdownGuard>,
}

impl MemoryBackend {
    /// Creates a backend with the default sweep interval.
    ///
    /// Must be called from within a tokio runtime: the expiry sweeper is
    /// spawned here.
    pub fn new() -> Self {
        Self::with_sweep_interval(DEFAULT_SWEEP_INTERVAL)
    }

    /// Creates a backend whose sweeper wakes every `interval`.
    pub fn with_sweep_interval(interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let data: Arc<RwLock<Store>> = Arc::new(RwLock::new(BTreeMap::new()));

        // The sweeper holds only the map, so it never keeps the guard alive.
        let sweep_data = Arc::clone(&data);
        tokio::spawn(async move {
            sweep_expired(sweep_data, interval, shutdown_rx).await;
        });

        Self { data, shutdown_guard: Arc::new(ShutdownGuard { shutdown_tx }) }
    }

    /// Signals the background sweeper to stop. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.shutdown_guard.shutdown_tx.send(());
    }

    /// Number of entries physically held, expired or not.
    pub fn raw_len(&self) -> usize {
        self.data.read().len()
    }

    fn live_value(store: &Store, key: &[u8], now: Instant) -> Option<Bytes> {
        store.get(key).filter(|entry| entry.is_live(now)).map(|entry| entry.value.clone())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend").field("entries", &self.raw_len()).finish()
    }
}

async fn sweep_expired(
    data: Arc<RwLock<Store>>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<()>,
) {
    loop {
        select! {
            _ = sleep(interval) => {}
            _ = shutdown_rx.changed() => return,
        }

        let now = Instant::now();
        let removed = {
            let mut store = data.write();
            let before = store.len();
            store.retain(|_, entry| entry.is_live(now));
            before - store.len()
        };
        if removed > 0 {
            tracing::trace!(removed, "swept expired entries");
        }
    }
}

fn to_slice_bounds<R: RangeBounds<Vec<u8>>>(range: &R) -> (Bound<&[u8]>, Bound<&[u8]>) {
    let start = match range.start_bound() {
        Bound::Included(b) => Bound::Included(b.as_slice()),
        Bound::Excluded(b) => Bound::Excluded(b.as_slice()),
        Bound::Unbounded => Bound::Unbounded,
    };
    let end = match range.end_bound() {
        Bound::Included(b) => Bound::Included(b.as_slice()),
        Bound::Excluded(b) => Bound::Excluded(b.as_slice()),
        Bound::Unbounded => Bound::Unbounded,
    };
    (start, end)
}

/// `BTreeMap::range` panics on inverted or empty-excluded bounds; treat those
/// ranges as empty instead.
fn is_empty_range(start: Bound<&[u8]>, end: Bound<&[u8]>) -> bool {
    match (start, end) {
        (Bound::Included(s), Bound::Included(e)) => s > e,
        (Bound::Included(s), Bound::Excluded(e))
        | (Bound::Excluded(s), Bound::Included(e))
        | (Bound::Excluded(s), Bound::Excluded(e)) => s >= e,
        _ => false,
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    #[tracing::instrument(skip(self, key), fields(key_len = key.len()))]
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        fail::fail_point!("memory-backend-get", |_| Err(StorageError::connection(
            "injected get failure"
        )));

        let store = self.data.read();
        Ok(Self::live_value(&store, key, Instant::now()))
    }

    #[tracing::instrument(skip(self, key, value), fields(key_len = key.len(), value_len = value.len()))]
    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()> {
        fail::fail_point!("memory-backend-set", |_| Err(StorageError::connection(
            "injected set failure"
        )));

        self.data.write().insert(key, Entry { value: Bytes::from(value), expires_at: None });
        Ok(())
    }

    #[tracing::instrument(skip(self, key, value), fields(key_len = key.len(), ttl_ms = ttl.as_millis() as u64))]
    async fn set_with_ttl(&self, key: Vec<u8>, value: Vec<u8>, ttl: Duration) -> StorageResult<()> {
        fail::fail_point!("memory-backend-set", |_| Err(StorageError::connection(
            "injected set failure"
        )));

        let expires_at = Instant::now().checked_add(ttl);
        self.data.write().insert(key, Entry { value: Bytes::from(value), expires_at });
        Ok(())
    }

    #[tracing::instrument(skip(self, key, expected, new_value), fields(key_len = key.len()))]
    async fn compare_and_set(
        &self,
        key: &[u8],
        expected: Option<&[u8]>,
        new_value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> StorageResult<()> {
        fail::fail_point!("memory-backend-cas", |_| Err(StorageError::connection(
            "injected compare-and-set failure"
        )));

        let now = Instant::now();
        let mut store = self.data.write();
        let current = Self::live_value(&store, key, now);

        let matches = match (expected, &current) {
            (None, None) => true,
            (Some(exp), Some(cur)) => exp == &cur[..],
            _ => false,
        };
        if !matches {
            return Err(StorageError::Conflict);
        }

        let expires_at = ttl.and_then(|ttl| now.checked_add(ttl));
        store.insert(key.to_vec(), Entry { value: Bytes::from(new_value), expires_at });
        Ok(())
    }

    #[tracing::instrument(skip(self, key), fields(key_len = key.len()))]
    async fn delete(&self, key: &[u8]) -> StorageResult<()> {
        fail::fail_point!("memory-backend-delete", |_| Err(StorageError::connection(
            "injected delete failure"
        )));

        self.data.write().remove(key);
        Ok(())
    }

    #[tracing::instrument(skip(self, range))]
    async fn get_range<R>(&self, range: R) -> StorageResult<Vec<KeyValue>>
    where
        R: RangeBounds<Vec<u8>> + Send,
    {
        fail::fail_point!("memory-backend-get-range", |_| Err(StorageError::connection(
            "injected range failure"
        )));

        let (start, end) = to_slice_bounds(&range);
        if is_empty_range(start, end) {
            return Ok(Vec::new());
        }

        let now = Instant::now();
        let store = self.data.read();
        Ok(store
            .range::<[u8], _>((start, end))
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(k, entry)| KeyValue::new(Bytes::copy_from_slice(k), entry.value.clone()))
            .collect())
    }

    #[tracing::instrument(skip(self, range))]
    async fn get_range_limited<R>(&self, range: R, limit: usize) -> StorageResult<Vec<KeyValue>>
    where
        R: RangeBounds<Vec<u8>> + Send,
    {
        fail::fail_point!("memory-backend-get-range", |_| Err(StorageError::connection(
            "injected range failure"
        )));

        let (start, end) = to_slice_bounds(&range);
        if limit == 0 || is_empty_range(start, end) {
            return Ok(Vec::new());
        }

        let now = Instant::now();
        let store = self.data.read();
        Ok(store
            .range::<[u8], _>((start, end))
            .filter(|(_, entry)| entry.is_live(now))
            .take(limit)
            .map(|(k, entry)| KeyValue::new(Bytes::copy_from_slice(k), entry.value.clone()))
            .collect())
    }

    #[tracing::instrument(skip(self, range))]
    async fn clear_range<R>(&self, range: R) -> StorageResult<()>
    where
        R: RangeBounds<Vec<u8>> + Send,
    {
        let (start, end) = to_slice_bounds(&range);
        if is_empty_range(start, end) {
            return Ok(());
        }

        let mut store = self.data.write();
        let doomed: Vec<Vec<u8>> =
            store.range::<[u8], _>((start, end)).map(|(k, _)| k.clone()).collect();
        for key in &doomed {
            store.remove(key);
        }
        Ok(())
    }

    async fn transaction(&self) -> StorageResult<Box<dyn Transaction>> {
        Ok(Box::new(MemoryTransaction::new(self.clone())))
    }

    async fn health_check(&self) -> StorageResult<()> {
        let _guard = self.data.read();
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct CasOperation {
    key: Vec<u8>,
    expected: Option<Vec<u8>>,
    new_value: Vec<u8>,
}

/// Buffers writes until commit, with read-your-writes.
struct MemoryTransaction {
    backend: MemoryBackend,
    pending_writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    pending_cas: Vec<CasOperation>,
}

impl MemoryTransaction {
    fn new(backend: MemoryBackend) -> Self {
        Self { backend, pending_writes: BTreeMap::new(), pending_cas: Vec::new() }
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn get(&self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        if let Some(value) = self.pending_writes.get(key) {
            return Ok(value.as_ref().map(|v| Bytes::copy_from_slice(v)));
        }
        self.backend.get(key).await
    }

    fn set(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.pending_writes.insert(key, Some(value));
    }

    fn delete(&mut self, key: Vec<u8>) {
        self.pending_writes.insert(key, None);
    }

    fn compare_and_set(
        &mut self,
        key: Vec<u8>,
        expected: Option<Vec<u8>>,
        new_value: Vec<u8>,
    ) -> StorageResult<()> {
        self.pending_cas.push(CasOperation { key, expected, new_value });
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(writes = self.pending_writes.len(), cas = self.pending_cas.len()))]
    async fn commit(self: Box<Self>) -> StorageResult<()> {
        fail::fail_point!("memory-transaction-commit", |_| Err(StorageError::connection(
            "injected commit failure"
        )));

        let now = Instant::now();
        let mut store = self.backend.data.write();

        for cas in &self.pending_cas {
            let current = MemoryBackend::live_value(&store, &cas.key, now);
            let matches = match (&cas.expected, &current) {
                (None, None) => true,
                (Some(expected), Some(current)) => expected.as_slice() == &current[..],
                _ => false,
            };
            if !matches {
                return Err(StorageError::Conflict);
            }
        }

        for cas in self.pending_cas {
            store.insert(cas.key, Entry { value: Bytes::from(cas.new_value), expires_at: None });
        }
        for (key, value) in self.pending_writes {
            match value {
                Some(v) => {
                    store.insert(key, Entry { value: Bytes::from(v), expires_at: None });
                },
                None => {
                    store.remove(&key);
                },
            }
        }
        Ok(())
    }
}
