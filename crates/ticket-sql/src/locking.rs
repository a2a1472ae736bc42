//! Cleanup lock stored as a row of the `locks` table.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::TimeDelta;
use parking_lot::Mutex;
use rusqlite::{Connection, params};
use ticketd_ticket::{LockingStrategy, TicketResult, clock::SharedClock, locking::DEFAULT_LOCK_LEASE};
use tracing::debug;

use crate::error::storage_error;

/// Name of the lock row taken by ticket cleaners.
pub const CLEANER_LOCK_NAME: &str = "ticket-registry-cleaner";

/// Takes the row when it is absent, already ours, or past its lease.
const ACQUIRE: &str = "INSERT INTO locks (name, holder, expires_at) VALUES (?1, ?2, ?3)
    ON CONFLICT (name) DO UPDATE SET
        holder = excluded.holder,
        expires_at = excluded.expires_at
    WHERE locks.holder = excluded.holder OR locks.expires_at < ?4";

const RELEASE: &str = "DELETE FROM locks WHERE name = ?1 AND holder = ?2";

/// [`LockingStrategy`] backed by a lease row in the registry database.
///
/// Created by [`SqlTicketRegistry::locking_strategy`](crate::SqlTicketRegistry::locking_strategy);
/// it shares the registry's connection and clock.
#[derive(Clone)]
pub struct SqlLockingStrategy {
    conn: Arc<Mutex<Connection>>,
    clock: SharedClock,
    name: String,
    holder: String,
    lease: Duration,
}

impl SqlLockingStrategy {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>, clock: SharedClock, holder: String) -> Self {
        Self { conn, clock, name: CLEANER_LOCK_NAME.to_owned(), holder, lease: DEFAULT_LOCK_LEASE }
    }

    /// Uses `lease` instead of the default lease length.
    #[must_use]
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Uses the row called `name`, for locks other than the cleaner's.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl fmt::Debug for SqlLockingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlLockingStrategy")
            .field("name", &self.name)
            .field("holder", &self.holder)
            .field("lease", &self.lease)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl LockingStrategy for SqlLockingStrategy {
    #[tracing::instrument(skip(self), fields(name = %self.name, holder = %self.holder))]
    async fn acquire(&self) -> TicketResult<bool> {
        let now = self.clock.now();
        let until = TimeDelta::from_std(self.lease)
            .ok()
            .and_then(|lease| now.checked_add_signed(lease))
            .unwrap_or(now);
        let changed = self
            .conn
            .lock()
            .execute(
                ACQUIRE,
                params![self.name, self.holder, until.timestamp_millis(), now.timestamp_millis()],
            )
            .map_err(storage_error)?;
        if changed == 0 {
            debug!("lock row held elsewhere");
        }
        Ok(changed == 1)
    }

    #[tracing::instrument(skip(self), fields(name = %self.name, holder = %self.holder))]
    async fn release(&self) -> TicketResult<()> {
        self.conn.lock().execute(RELEASE, params![self.name, self.holder]).map_err(storage_error)?;
        Ok(())
    }
}
