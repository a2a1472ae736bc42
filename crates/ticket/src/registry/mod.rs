//! Ticket registry contract and backend adapters.
//!
//! [`TicketRegistry`] is the single shared mutable resource of the ticket
//! subsystem. Adapters implement a small set of raw primitives; the expiry
//! filtering, typed lookup, enumeration and counting built on top of them are
//! provided methods, so every backend answers them the same way.
//!
//! | Adapter | Storage | Atomic read-modify-write |
//! |---------|---------|--------------------------|
//! | [`MemoryTicketRegistry`] | ordered maps, one per kind | write lock |
//! | [`CacheTicketRegistry`] | any [`StorageBackend`](ticketd_storage::StorageBackend), native TTL | compare-and-set loop |
//! | [`DocumentTicketRegistry`] | any [`StorageBackend`](ticketd_storage::StorageBackend), records plus secondary indices | transactional compare-and-set loop |
//!
//! The relational adapter lives in the `ticketd-ticket-sql` crate and uses
//! the same contract with an immediate SQL transaction.
//!
//! Raw primitives ([`find_ticket`](TicketRegistry::find_ticket),
//! [`mutate_ticket`](TicketRegistry::mutate_ticket),
//! [`scan_tickets`](TicketRegistry::scan_tickets)) may return expired tickets.
//! Everything a protocol adapter should use filters them out.

mod cache;
mod document;
mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

pub use cache::CacheTicketRegistry;
pub use document::DocumentTicketRegistry;
pub use memory::MemoryTicketRegistry;

use crate::{
    catalog::TicketCatalog,
    clock::SharedClock,
    config::RegistryConfig,
    error::{TicketError, TicketResult},
    revocation::{self, RevocationLimits},
    ticket::{Expirable, Ticket, TicketKind},
};

/// Filter applied to stored tickets.
pub type TicketPredicate<'a> = dyn Fn(&Ticket) -> bool + Send + Sync + 'a;

/// In-place update applied by [`TicketRegistry::mutate_ticket`].
///
/// Returning an error aborts the update; nothing is written.
pub type TicketMutation<'a> = dyn Fn(&mut Ticket) -> TicketResult<()> + Send + Sync + 'a;

/// Page size used by the provided enumeration methods.
pub const DEFAULT_SCAN_BATCH: usize = 256;

/// One page of a [`TicketRegistry::scan_tickets`] enumeration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TicketPage {
    /// Tickets in storage-key order. May include expired tickets.
    pub tickets: Vec<Ticket>,
    /// Cursor for the next page; `None` once the kind is exhausted.
    pub next_cursor: Option<String>,
}

/// Storage of tickets, keyed by id.
///
/// Implementations must be safe for concurrent use. The only compound
/// operation they must make atomic is [`mutate_ticket`](Self::mutate_ticket):
/// no two concurrent mutations of one id may both observe the same prior
/// state.
#[async_trait]
pub trait TicketRegistry: Send + Sync + std::fmt::Debug {
    /// The catalog used to map ids to kinds and storage partitions.
    fn catalog(&self) -> &TicketCatalog;

    /// The clock used for expiry filtering.
    fn clock(&self) -> SharedClock;

    /// Returns the stored ticket for `id`, expired or not.
    ///
    /// Ids whose prefix is not in the catalog are simply absent.
    async fn find_ticket(&self, id: &str) -> TicketResult<Option<Ticket>>;

    /// Stores a new ticket.
    ///
    /// # Errors
    ///
    /// - [`TicketError::DuplicateTicket`] if the id is already stored
    /// - [`TicketError::UnknownTicketPrefix`] if the catalog has no entry for the id
    /// - [`TicketError::TypeMismatch`] if the prefix belongs to another kind
    async fn add_ticket(&self, ticket: &Ticket) -> TicketResult<()>;

    /// Persists a ticket's current state, inserting it if absent.
    ///
    /// Prefer [`mutate_ticket`](Self::mutate_ticket) for state that concurrent
    /// requests may change.
    async fn update_ticket(&self, ticket: &Ticket) -> TicketResult<()>;

    /// Removes exactly one ticket without touching its descendants.
    ///
    /// Returns the number of tickets removed, 0 or 1.
    async fn delete_single_ticket(&self, id: &str) -> TicketResult<usize>;

    /// Removes every ticket. Returns how many were removed.
    async fn delete_all(&self) -> TicketResult<usize>;

    /// Atomically applies `mutation` to the stored ticket.
    ///
    /// Returns the updated ticket, or `None` if the id is not stored. The
    /// stored ticket is handed to `mutation` even if it is expired, so the
    /// caller can tell expired from missing. An error from `mutation` is
    /// returned unchanged and leaves the stored ticket untouched.
    async fn mutate_ticket(
        &self,
        id: &str,
        mutation: &TicketMutation<'_>,
    ) -> TicketResult<Option<Ticket>>;

    /// Returns up to `limit` tickets of `kind` whose storage key sorts after
    /// `cursor`.
    ///
    /// Expired tickets are included, since the cleaner needs them.
    async fn scan_tickets(
        &self,
        kind: TicketKind,
        cursor: Option<&str>,
        limit: usize,
    ) -> TicketResult<TicketPage>;

    /// Returns the ticket for `id` unless it is missing or expired.
    #[tracing::instrument(skip(self))]
    async fn get_ticket(&self, id: &str) -> TicketResult<Option<Ticket>> {
        let now = self.clock().now();
        Ok(self.find_ticket(id).await?.filter(|ticket| !ticket.is_expired_at(now)))
    }

    /// Returns the live ticket for `id` if it satisfies `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`TicketError::TypeMismatch`] when the id resolves to a ticket
    /// `kind` does not accept. Missing and expired tickets are `Ok(None)`.
    #[tracing::instrument(skip(self))]
    async fn get_typed_ticket(&self, id: &str, kind: TicketKind) -> TicketResult<Option<Ticket>> {
        match self.get_ticket(id).await? {
            Some(ticket) if !kind.accepts(ticket.kind()) => Err(TicketError::TypeMismatch {
                id: id.to_owned(),
                expected: kind,
                actual: ticket.kind(),
            }),
            found => Ok(found),
        }
    }

    /// Returns the live ticket for `id` if it satisfies `kind` and `predicate`.
    ///
    /// # Errors
    ///
    /// As [`get_typed_ticket`](Self::get_typed_ticket).
    #[tracing::instrument(skip(self, predicate))]
    async fn get_ticket_matching(
        &self,
        id: &str,
        kind: TicketKind,
        predicate: &TicketPredicate<'_>,
    ) -> TicketResult<Option<Ticket>> {
        Ok(self.get_typed_ticket(id, kind).await?.filter(|ticket| predicate(ticket)))
    }

    /// Returns every live ticket matching `predicate`, kind by kind.
    ///
    /// Reads in bounded batches so large registries are never loaded under a
    /// single lock or request.
    #[tracing::instrument(skip_all)]
    async fn get_tickets(&self, predicate: &TicketPredicate<'_>) -> TicketResult<Vec<Ticket>> {
        let mut found = Vec::new();
        for kind in TicketKind::ALL {
            let mut cursor: Option<String> = None;
            loop {
                let page = self.scan_tickets(kind, cursor.as_deref(), DEFAULT_SCAN_BATCH).await?;
                let now = self.clock().now();
                found.extend(
                    page.tickets
                        .into_iter()
                        .filter(|ticket| !ticket.is_expired_at(now) && predicate(ticket)),
                );
                match page.next_cursor {
                    Some(next) => cursor = Some(next),
                    None => break,
                }
            }
        }
        Ok(found)
    }

    /// Removes a ticket and, for granting tickets, everything it minted.
    ///
    /// Idempotent: a missing id removes nothing and returns 0. Descendants that
    /// could not be removed are logged and left to the cleaner; use
    /// [`revocation::revoke`] directly to inspect them.
    #[tracing::instrument(skip(self))]
    async fn delete_ticket(&self, id: &str) -> TicketResult<usize> {
        let report = revocation::revoke(self, id, RevocationLimits::default()).await?;
        Ok(report.deleted)
    }

    /// Number of live root sessions held by `principal`.
    #[tracing::instrument(skip(self))]
    async fn count_sessions_for(&self, principal: &str) -> TicketResult<usize> {
        let sessions = self.get_tickets(&|ticket: &Ticket| ticket.is_session_of(principal)).await?;
        Ok(sessions.len())
    }

    /// Number of live service and proxy tickets issued for `service`.
    #[tracing::instrument(skip(self))]
    async fn count_tickets_for(&self, service: &str) -> TicketResult<usize> {
        let tickets =
            self.get_tickets(&|ticket: &Ticket| ticket.service_id() == Some(service)).await?;
        Ok(tickets.len())
    }
}

/// Last instant at which an index entry for `ticket` counts as live.
///
/// Index readers treat an entry as live while `now <= deadline`, matching
/// [`ExpirationPolicy::is_expired`](crate::ExpirationPolicy::is_expired). The
/// deadline is capped by [`RegistryConfig::max_ttl`]. A ticket that can never
/// be used again gets the Unix epoch, so it stops counting at once.
#[must_use]
pub fn live_until(config: &RegistryConfig, ticket: &Ticket, now: DateTime<Utc>) -> DateTime<Utc> {
    let ttl = ticket.time_to_live(now);
    if ttl == Some(Duration::ZERO) && ticket.is_expired_at(now) {
        return DateTime::UNIX_EPOCH;
    }
    TimeDelta::from_std(config.capped_ttl(ttl))
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Resolves the catalog partition for a ticket about to be written.
///
/// Adapters call this before every add or update so that an id can never be
/// stored under a kind its prefix does not name.
///
/// # Errors
///
/// - [`TicketError::UnknownTicketPrefix`] if the catalog has no entry for the id
/// - [`TicketError::TypeMismatch`] if the prefix belongs to another kind
pub fn partition_for<'c>(
    catalog: &'c TicketCatalog,
    ticket: &Ticket,
) -> TicketResult<&'c crate::catalog::TicketDefinition> {
    let id = ticket.id();
    let definition = catalog.find_by_id(id).ok_or_else(|| TicketError::unknown_prefix(id))?;
    if definition.kind != ticket.kind() {
        return Err(TicketError::TypeMismatch {
            id: id.to_owned(),
            expected: definition.kind,
            actual: ticket.kind(),
        });
    }
    Ok(definition)
}
