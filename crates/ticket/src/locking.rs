//! Cluster-wide exclusion for the cleanup sweep.
//!
//! Every node of a cluster runs a [`TicketRegistryCleaner`](crate::TicketRegistryCleaner)
//! against the same shared registry. A [`LockingStrategy`] lets exactly one of
//! them sweep at a time; the others skip that round.
//!
//! | Strategy | Scope |
//! |----------|-------|
//! | [`NoOpLockingStrategy`] | single node, always acquires |
//! | [`StorageLockingStrategy`] | any [`StorageBackend`] shared by the cluster, lease held in one key |
//!
//! Locks are leases: a holder that dies without releasing loses the lock once
//! the lease elapses. The lease must outlast one sweep.

use std::{fmt, time::Duration};

use async_trait::async_trait;
use ticketd_storage::{StorageBackend, StorageError};
use tracing::debug;

use crate::error::TicketResult;

/// Default lease of a cleanup lock.
pub const DEFAULT_LOCK_LEASE: Duration = Duration::from_secs(300);

/// Storage key of the cleanup lock used by [`StorageLockingStrategy`].
pub const DEFAULT_LOCK_KEY: &[u8] = b"locks:ticket-registry-cleaner";

/// Non-blocking mutual exclusion between cleaners.
#[async_trait]
pub trait LockingStrategy: Send + Sync + fmt::Debug {
    /// Tries to take or renew the lock without waiting.
    ///
    /// Returns `false` when another holder owns a live lease.
    async fn acquire(&self) -> TicketResult<bool>;

    /// Gives the lock up if this holder still owns it.
    ///
    /// Releasing a lock that lapsed or was never taken is a no-op.
    async fn release(&self) -> TicketResult<()>;
}

/// Always acquires. For a registry that only one node sweeps.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpLockingStrategy;

#[async_trait]
impl LockingStrategy for NoOpLockingStrategy {
    async fn acquire(&self) -> TicketResult<bool> {
        Ok(true)
    }

    async fn release(&self) -> TicketResult<()> {
        Ok(())
    }
}

/// Lease lock held in a single backend key.
///
/// The key holds the holder id and expires natively after the lease.
/// Acquire is an insert-if-absent, renewal a compare-and-set on the holder's
/// own id, and release a deletion guarded by the same comparison.
#[derive(Clone)]
pub struct StorageLockingStrategy<B> {
    backend: B,
    key: Vec<u8>,
    holder: String,
    lease: Duration,
}

#[bon::bon]
impl<B: StorageBackend> StorageLockingStrategy<B> {
    /// Creates a lock owned by `holder`, which must be unique per node.
    #[builder]
    pub fn new(
        backend: B,
        #[builder(into)] holder: String,
        #[builder(default = DEFAULT_LOCK_KEY.to_vec())] key: Vec<u8>,
        #[builder(default = DEFAULT_LOCK_LEASE)] lease: Duration,
    ) -> Self {
        Self { backend, key, holder, lease }
    }
}

impl<B> fmt::Debug for StorageLockingStrategy<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageLockingStrategy")
            .field("key", &String::from_utf8_lossy(&self.key))
            .field("holder", &self.holder)
            .field("lease", &self.lease)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<B: StorageBackend> LockingStrategy for StorageLockingStrategy<B> {
    #[tracing::instrument(skip(self), fields(holder = %self.holder))]
    async fn acquire(&self) -> TicketResult<bool> {
        let holder = self.holder.as_bytes();
        match self.backend.compare_and_set(&self.key, None, holder.to_vec(), Some(self.lease)).await {
            Ok(()) => return Ok(true),
            Err(StorageError::Conflict) => {},
            Err(e) => return Err(e.into()),
        }

        match self
            .backend
            .compare_and_set(&self.key, Some(holder), holder.to_vec(), Some(self.lease))
            .await
        {
            Ok(()) => Ok(true),
            Err(StorageError::Conflict) => {
                debug!("cleanup lock held elsewhere");
                Ok(false)
            },
            Err(e) => Err(e.into()),
        }
    }

    #[tracing::instrument(skip(self), fields(holder = %self.holder))]
    async fn release(&self) -> TicketResult<()> {
        let holder = self.holder.as_bytes().to_vec();
        let mut txn = self.backend.transaction().await?;
        txn.compare_and_set(self.key.clone(), Some(holder.clone()), holder)?;
        txn.delete(self.key.clone());
        match txn.commit().await {
            Ok(()) => Ok(()),
            Err(StorageError::Conflict) => {
                debug!("cleanup lock already lapsed");
                Ok(())
            },
            Err(e) => Err(e.into()),
        }
    }
}
