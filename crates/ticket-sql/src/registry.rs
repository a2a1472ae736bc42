//! [`TicketRegistry`] over a single SQLite connection.

use std::{fmt, path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use ticketd_storage::StorageError;
use ticketd_ticket::{
    Expirable, RegistryConfig, Ticket, TicketCatalog, TicketCodec, TicketError, TicketKind,
    TicketMutation, TicketPage, TicketRegistry, TicketResult,
    clock::{SharedClock, system_clock},
    registry::{live_until, partition_for},
};
use tracing::debug;

use crate::{
    error::{SqlRegistryError, storage_error},
    locking::SqlLockingStrategy,
};

const SCHEMA: &str = include_str!("schema.sql");

/// Longest wait for another process's write lock before a statement fails.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(250);

const UPSERT: &str = "INSERT INTO tickets
        (id_digest, kind, payload, principal_digest, service, parent_digest, expires_at)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
    ON CONFLICT (id_digest) DO UPDATE SET
        kind = excluded.kind,
        payload = excluded.payload,
        principal_digest = excluded.principal_digest,
        service = excluded.service,
        parent_digest = excluded.parent_digest,
        expires_at = excluded.expires_at";

const INSERT: &str = "INSERT INTO tickets
        (id_digest, kind, payload, principal_digest, service, parent_digest, expires_at)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)";

/// One `tickets` row, ready to bind.
struct TicketRow {
    id_digest: String,
    kind: &'static str,
    payload: Vec<u8>,
    principal_digest: Option<String>,
    service: Option<String>,
    parent_digest: Option<String>,
    expires_at: i64,
}

/// Relational ticket registry: one row per ticket in a `tickets` table.
///
/// Atomic read-modify-write uses an `IMMEDIATE` transaction, which also
/// serializes writers from other processes sharing the file.
///
/// # Blocking
///
/// SQLite calls are synchronous. Every statement runs on the calling tokio
/// worker under a connection mutex, and a statement that meets a write lock
/// held by another process waits up to `busy_timeout` before failing with a
/// transient [`StorageError::Connection`]. Use a local database file (or
/// `:memory:`) owned by this process and keep `busy_timeout` short; a
/// database on network storage, or one shared with long-running writers,
/// stalls the runtime threads serving tickets.
#[derive(Clone)]
pub struct SqlTicketRegistry {
    conn: Arc<Mutex<Connection>>,
    catalog: TicketCatalog,
    clock: SharedClock,
    codec: TicketCodec,
    config: RegistryConfig,
}

#[bon::bon]
impl SqlTicketRegistry {
    /// Creates a registry over `connection`, creating the schema if needed.
    ///
    /// # Errors
    ///
    /// Returns [`SqlRegistryError`] if `config` is invalid or the schema
    /// cannot be applied.
    #[builder]
    pub fn new(
        connection: Connection,
        #[builder(default)] catalog: TicketCatalog,
        #[builder(default = system_clock())] clock: SharedClock,
        #[builder(default)] codec: TicketCodec,
        #[builder(default)] config: RegistryConfig,
        #[builder(default = DEFAULT_BUSY_TIMEOUT)] busy_timeout: Duration,
    ) -> Result<Self, SqlRegistryError> {
        config.validate()?;
        init_connection(&connection, busy_timeout)?;
        Ok(Self { conn: Arc::new(Mutex::new(connection)), catalog, clock, codec, config })
    }

    /// Opens (or creates) a file-backed registry with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`SqlRegistryError::Open`] if the file cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SqlRegistryError> {
        let connection = Connection::open(path).map_err(SqlRegistryError::Open)?;
        Self::builder().connection(connection).build()
    }

    /// Creates a private in-memory registry with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`SqlRegistryError::Open`] if SQLite cannot allocate the database.
    pub fn open_in_memory() -> Result<Self, SqlRegistryError> {
        let connection = Connection::open_in_memory().map_err(SqlRegistryError::Open)?;
        Self::builder().connection(connection).build()
    }

    fn expires_at(&self, ticket: &Ticket, now: DateTime<Utc>) -> i64 {
        live_until(&self.config, ticket, now).timestamp_millis()
    }

    fn row(&self, ticket: &Ticket) -> TicketResult<TicketRow> {
        Ok(TicketRow {
            id_digest: self.codec.digest(ticket.id()),
            kind: ticket.kind().as_str(),
            payload: self.codec.seal(ticket)?,
            principal_digest: ticket.principal_id().map(|p| self.codec.digest(p)),
            service: ticket.service_id().map(str::to_owned),
            parent_digest: ticket.parent_id().map(|p| self.codec.digest(p)),
            expires_at: self.expires_at(ticket, self.clock.now()),
        })
    }

    /// Row key and kind column for `id`, if the catalog knows its prefix.
    fn locate(&self, id: &str) -> Option<(String, &'static str)> {
        let definition = self.catalog.find_by_id(id)?;
        Some((self.codec.digest(id), definition.kind.as_str()))
    }

    /// A cleanup lock stored in this database's `locks` table, owned by
    /// `holder`.
    ///
    /// Every node pointing at the same database file shares the lock row.
    #[must_use]
    pub fn locking_strategy(&self, holder: impl Into<String>) -> SqlLockingStrategy {
        SqlLockingStrategy::new(Arc::clone(&self.conn), Arc::clone(&self.clock), holder.into())
    }

    fn count(&self, sql: &str, key: &str) -> TicketResult<usize> {
        let now = self.clock.now().timestamp_millis();
        let conn = self.conn.lock();
        let count: i64 =
            conn.query_row(sql, params![key, now], |row| row.get(0)).map_err(storage_error)?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

fn init_connection(conn: &Connection, busy_timeout: Duration) -> Result<(), SqlRegistryError> {
    // In-memory databases stay in "memory" mode; the reported mode is ignored.
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
        .map_err(SqlRegistryError::Schema)?;
    conn.pragma_update(None, "synchronous", "NORMAL").map_err(SqlRegistryError::Schema)?;
    conn.busy_timeout(busy_timeout).map_err(SqlRegistryError::Schema)?;
    conn.execute_batch(SCHEMA).map_err(SqlRegistryError::Schema)?;
    Ok(())
}

fn bind(conn: &Connection, sql: &str, row: &TicketRow) -> rusqlite::Result<usize> {
    conn.execute(
        sql,
        params![
            row.id_digest,
            row.kind,
            row.payload,
            row.principal_digest,
            row.service,
            row.parent_digest,
            row.expires_at,
        ],
    )
}

impl fmt::Debug for SqlTicketRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlTicketRegistry").field("config", &self.config).finish_non_exhaustive()
    }
}

#[async_trait]
impl TicketRegistry for SqlTicketRegistry {
    fn catalog(&self) -> &TicketCatalog {
        &self.catalog
    }

    fn clock(&self) -> SharedClock {
        Arc::clone(&self.clock)
    }

    #[tracing::instrument(skip(self))]
    async fn find_ticket(&self, id: &str) -> TicketResult<Option<Ticket>> {
        let Some((digest, kind)) = self.locate(id) else {
            return Ok(None);
        };
        let payload: Option<Vec<u8>> = self
            .conn
            .lock()
            .query_row(
                "SELECT payload FROM tickets WHERE id_digest = ?1 AND kind = ?2",
                params![digest, kind],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_error)?;
        payload.map(|sealed| self.codec.open(&sealed)).transpose()
    }

    #[tracing::instrument(skip(self, ticket), fields(id = %ticket.id(), kind = %ticket.kind()))]
    async fn add_ticket(&self, ticket: &Ticket) -> TicketResult<()> {
        partition_for(&self.catalog, ticket)?;
        let row = self.row(ticket)?;
        match bind(&self.conn.lock(), INSERT, &row).map_err(storage_error) {
            Ok(_) => Ok(()),
            Err(StorageError::Conflict) => Err(TicketError::duplicate(ticket.id())),
            Err(e) => Err(e.into()),
        }
    }

    #[tracing::instrument(skip(self, ticket), fields(id = %ticket.id(), kind = %ticket.kind()))]
    async fn update_ticket(&self, ticket: &Ticket) -> TicketResult<()> {
        partition_for(&self.catalog, ticket)?;
        let row = self.row(ticket)?;
        bind(&self.conn.lock(), UPSERT, &row).map_err(storage_error)?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn delete_single_ticket(&self, id: &str) -> TicketResult<usize> {
        let Some((digest, kind)) = self.locate(id) else {
            return Ok(0);
        };
        let removed = self
            .conn
            .lock()
            .execute("DELETE FROM tickets WHERE id_digest = ?1 AND kind = ?2", params![digest, kind])
            .map_err(storage_error)?;
        Ok(removed)
    }

    #[tracing::instrument(skip(self))]
    async fn delete_all(&self) -> TicketResult<usize> {
        let removed = self.conn.lock().execute("DELETE FROM tickets", []).map_err(storage_error)?;
        Ok(removed)
    }

    #[tracing::instrument(skip(self, mutation))]
    async fn mutate_ticket(
        &self,
        id: &str,
        mutation: &TicketMutation<'_>,
    ) -> TicketResult<Option<Ticket>> {
        let Some((digest, kind)) = self.locate(id) else {
            return Ok(None);
        };

        let mut conn = self.conn.lock();
        let txn = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(storage_error)?;
        let payload: Option<Vec<u8>> = txn
            .query_row(
                "SELECT payload FROM tickets WHERE id_digest = ?1 AND kind = ?2",
                params![digest, kind],
                |row| row.get(0),
            )
            .optional()
            .map_err(storage_error)?;
        let Some(sealed) = payload else {
            return Ok(None);
        };

        let mut ticket = self.codec.open(&sealed)?;
        // Dropping the transaction on error rolls it back.
        mutation(&mut ticket)?;
        let row = self.row(&ticket)?;
        bind(&txn, UPSERT, &row).map_err(storage_error)?;
        txn.commit().map_err(storage_error)?;
        Ok(Some(ticket))
    }

    #[tracing::instrument(skip(self))]
    async fn scan_tickets(
        &self,
        kind: TicketKind,
        cursor: Option<&str>,
        limit: usize,
    ) -> TicketResult<TicketPage> {
        let limit = limit.max(1);
        let rows: Vec<(String, Vec<u8>)> = {
            let conn = self.conn.lock();
            let mut stmt = conn
                .prepare_cached(
                    "SELECT id_digest, payload FROM tickets
                     WHERE kind = ?1 AND id_digest > ?2
                     ORDER BY id_digest
                     LIMIT ?3",
                )
                .map_err(storage_error)?;
            let mapped = stmt
                .query_map(
                    params![kind.as_str(), cursor.unwrap_or(""), i64::try_from(limit).unwrap_or(i64::MAX)],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map_err(storage_error)?;
            mapped.collect::<rusqlite::Result<_>>().map_err(storage_error)?
        };

        let mut page = TicketPage::default();
        let mut last_digest = None;
        for (digest, sealed) in rows {
            page.tickets.push(self.codec.open(&sealed)?);
            last_digest = Some(digest);
        }
        if page.tickets.len() == limit {
            page.next_cursor = last_digest;
        }
        debug!(%kind, returned = page.tickets.len(), "scanned ticket rows");
        Ok(page)
    }

    #[tracing::instrument(skip(self))]
    async fn count_sessions_for(&self, principal: &str) -> TicketResult<usize> {
        self.count(
            "SELECT COUNT(*) FROM tickets
             WHERE kind = 'ticket_granting' AND principal_digest = ?1 AND expires_at >= ?2",
            &self.codec.digest(principal),
        )
    }

    #[tracing::instrument(skip(self))]
    async fn count_tickets_for(&self, service: &str) -> TicketResult<usize> {
        self.count(
            "SELECT COUNT(*) FROM tickets
             WHERE kind IN ('service', 'proxy') AND service = ?1 AND expires_at >= ?2",
            service,
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use chrono::TimeDelta;
    use ticketd_ticket::testutil::{ManualClock, TEST_SERVICE, granting_ticket, service_ticket};

    use super::*;

    fn registry(clock: &ManualClock) -> SqlTicketRegistry {
        SqlTicketRegistry::builder()
            .connection(Connection::open_in_memory().unwrap())
            .clock(clock.shared())
            .build()
            .unwrap()
    }

    fn column<T: rusqlite::types::FromSql>(registry: &SqlTicketRegistry, sql: &str) -> T {
        registry.conn.lock().query_row(sql, [], |row| row.get(0)).unwrap()
    }

    #[tokio::test]
    async fn rows_carry_secondary_columns() {
        let clock = ManualClock::default();
        let registry = registry(&clock);
        registry.add_ticket(&granting_ticket("TGT-1-a", "casuser")).await.unwrap();
        registry.add_ticket(&service_ticket("ST-1-a", TEST_SERVICE, "TGT-1-a")).await.unwrap();

        let service: String =
            column(&registry, "SELECT service FROM tickets WHERE kind = 'service'");
        assert_eq!(service, TEST_SERVICE);

        let parent: String =
            column(&registry, "SELECT parent_digest FROM tickets WHERE kind = 'service'");
        assert_eq!(parent, registry.codec.digest("TGT-1-a"));

        let expires_at: i64 =
            column(&registry, "SELECT expires_at FROM tickets WHERE kind = 'service'");
        let ten_seconds = clock.now() + TimeDelta::seconds(10);
        assert_eq!(expires_at, ten_seconds.timestamp_millis());
    }

    #[tokio::test]
    async fn ids_and_payloads_are_not_stored_in_clear() {
        let clock = ManualClock::default();
        let registry = registry(&clock);
        registry.add_ticket(&granting_ticket("TGT-1-a", "casuser")).await.unwrap();

        let digest: String = column(&registry, "SELECT id_digest FROM tickets");
        assert_eq!(digest.len(), 128);
        assert_ne!(digest, "TGT-1-a");
    }

    #[tokio::test]
    async fn mutation_error_rolls_back() {
        let clock = ManualClock::default();
        let registry = registry(&clock);
        registry.add_ticket(&granting_ticket("TGT-1-a", "casuser")).await.unwrap();

        let failing = |ticket: &mut Ticket| -> TicketResult<()> {
            ticket.mark_expired();
            Err(TicketError::duplicate("TGT-1-a"))
        };
        assert!(registry.mutate_ticket("TGT-1-a", &failing).await.is_err());

        let still_live = registry.get_ticket("TGT-1-a").await.unwrap();
        assert!(still_live.is_some());

        // The connection accepts new transactions after the rollback.
        let touch = |ticket: &mut Ticket| -> TicketResult<()> {
            let at = ticket.meta().last_used_at;
            ticket.meta_mut().touch(at);
            Ok(())
        };
        assert!(registry.mutate_ticket("TGT-1-a", &touch).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn expired_rows_are_not_counted() {
        let clock = ManualClock::default();
        let registry = registry(&clock);
        registry.add_ticket(&service_ticket("ST-1-a", TEST_SERVICE, "TGT-1-a")).await.unwrap();
        assert_eq!(registry.count_tickets_for(TEST_SERVICE).await.unwrap(), 1);

        clock.advance(Duration::from_secs(10));
        let at_deadline = registry.get_ticket("ST-1-a").await.unwrap();
        assert!(at_deadline.is_some(), "policy still accepts the ticket at its deadline");
        assert_eq!(registry.count_tickets_for(TEST_SERVICE).await.unwrap(), 1);

        clock.advance(Duration::from_millis(1));
        assert_eq!(registry.count_tickets_for(TEST_SERVICE).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn spent_ticket_stops_counting_immediately() {
        let clock = ManualClock::default();
        let registry = registry(&clock);
        let mut ticket = service_ticket("ST-1-a", TEST_SERVICE, "TGT-1-a");
        ticket.mark_expired();
        registry.add_ticket(&ticket).await.unwrap();

        assert_eq!(registry.count_tickets_for(TEST_SERVICE).await.unwrap(), 0);
    }

    #[test]
    fn busy_timeout_is_applied_to_the_connection() {
        let registry = SqlTicketRegistry::builder()
            .connection(Connection::open_in_memory().unwrap())
            .busy_timeout(Duration::from_millis(40))
            .build()
            .unwrap();
        let applied: i64 = column(&registry, "PRAGMA busy_timeout");
        assert_eq!(applied, 40);

        let defaulted: i64 = column(&SqlTicketRegistry::open_in_memory().unwrap(), "PRAGMA busy_timeout");
        assert_eq!(u128::try_from(defaulted).unwrap(), DEFAULT_BUSY_TIMEOUT.as_millis());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let result = SqlTicketRegistry::builder()
            .connection(Connection::open_in_memory().unwrap())
            .config(RegistryConfig::builder().cas_attempts(0).build())
            .build();
        assert!(matches!(result, Err(SqlRegistryError::Config(_))));
    }
}
