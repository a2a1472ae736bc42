//! Single-process ticket registry.
//!
//! One ordered map per ticket kind, keyed by the digested id and guarded by a
//! single [`parking_lot::RwLock`]. Read-modify-write runs under the write
//! lock, which makes it trivially atomic. Used as the reference adapter and
//! in tests.

use std::{collections::BTreeMap, ops::Bound, sync::Arc};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{TicketMutation, TicketPage, TicketRegistry, partition_for};
use crate::{
    catalog::TicketCatalog,
    clock::{SharedClock, system_clock},
    codec::TicketCodec,
    error::{TicketError, TicketResult},
    ticket::{Expirable, Ticket, TicketKind},
};

type Partitions = [BTreeMap<String, Ticket>; 4];

/// In-memory [`TicketRegistry`].
///
/// Cloning is cheap; clones share the same tickets.
///
/// # Example
///
/// ```
/// use ticketd_ticket::{MemoryTicketRegistry, TicketRegistry};
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let registry = MemoryTicketRegistry::new();
/// assert_eq!(registry.delete_ticket("TGT-1-missing").await.unwrap(), 0);
/// # });
/// ```
#[derive(Debug, Clone, bon::Builder)]
pub struct MemoryTicketRegistry {
    #[builder(skip)]
    partitions: Arc<RwLock<Partitions>>,
    #[builder(default)]
    catalog: TicketCatalog,
    #[builder(default = system_clock())]
    clock: SharedClock,
    #[builder(default)]
    codec: TicketCodec,
}

impl MemoryTicketRegistry {
    /// Creates an empty registry with the default catalog and the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Number of stored tickets, expired ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.partitions.read().iter().map(BTreeMap::len).sum()
    }

    /// Whether nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn locate(&self, id: &str) -> Option<(usize, String)> {
        let definition = self.catalog.find_by_id(id)?;
        Some((definition.kind.index(), self.codec.digest(id)))
    }
}

impl Default for MemoryTicketRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TicketRegistry for MemoryTicketRegistry {
    fn catalog(&self) -> &TicketCatalog {
        &self.catalog
    }

    fn clock(&self) -> SharedClock {
        Arc::clone(&self.clock)
    }

    #[tracing::instrument(skip(self))]
    async fn find_ticket(&self, id: &str) -> TicketResult<Option<Ticket>> {
        let Some((slot, key)) = self.locate(id) else {
            return Ok(None);
        };
        Ok(self.partitions.read()[slot].get(&key).cloned())
    }

    #[tracing::instrument(skip(self, ticket), fields(id = %ticket.id(), kind = %ticket.kind()))]
    async fn add_ticket(&self, ticket: &Ticket) -> TicketResult<()> {
        let slot = partition_for(&self.catalog, ticket)?.kind.index();
        let key = self.codec.digest(ticket.id());

        let mut partitions = self.partitions.write();
        if partitions[slot].contains_key(&key) {
            return Err(TicketError::duplicate(ticket.id()));
        }
        partitions[slot].insert(key, ticket.clone());
        Ok(())
    }

    #[tracing::instrument(skip(self, ticket), fields(id = %ticket.id(), kind = %ticket.kind()))]
    async fn update_ticket(&self, ticket: &Ticket) -> TicketResult<()> {
        let slot = partition_for(&self.catalog, ticket)?.kind.index();
        let key = self.codec.digest(ticket.id());
        self.partitions.write()[slot].insert(key, ticket.clone());
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn delete_single_ticket(&self, id: &str) -> TicketResult<usize> {
        let Some((slot, key)) = self.locate(id) else {
            return Ok(0);
        };
        Ok(usize::from(self.partitions.write()[slot].remove(&key).is_some()))
    }

    #[tracing::instrument(skip(self))]
    async fn delete_all(&self) -> TicketResult<usize> {
        let mut partitions = self.partitions.write();
        let removed = partitions.iter().map(BTreeMap::len).sum();
        partitions.iter_mut().for_each(BTreeMap::clear);
        Ok(removed)
    }

    #[tracing::instrument(skip(self, mutation))]
    async fn mutate_ticket(
        &self,
        id: &str,
        mutation: &TicketMutation<'_>,
    ) -> TicketResult<Option<Ticket>> {
        let Some((slot, key)) = self.locate(id) else {
            return Ok(None);
        };
        let mut partitions = self.partitions.write();
        let Some(stored) = partitions[slot].get_mut(&key) else {
            return Ok(None);
        };
        let mut updated = stored.clone();
        mutation(&mut updated)?;
        *stored = updated.clone();
        Ok(Some(updated))
    }

    #[tracing::instrument(skip(self))]
    async fn scan_tickets(
        &self,
        kind: TicketKind,
        cursor: Option<&str>,
        limit: usize,
    ) -> TicketResult<TicketPage> {
        let limit = limit.max(1);
        let start = cursor.map_or(Bound::Unbounded, Bound::Excluded);
        let partitions = self.partitions.read();
        let page: Vec<(&String, &Ticket)> = partitions[kind.index()]
            .range::<str, _>((start, Bound::Unbounded))
            .take(limit)
            .collect();

        let next_cursor =
            if page.len() == limit { page.last().map(|(key, _)| (*key).clone()) } else { None };
        Ok(TicketPage {
            tickets: page.into_iter().map(|(_, ticket)| ticket.clone()).collect(),
            next_cursor,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::testutil::{granting_ticket, service_ticket};

    #[tokio::test]
    async fn keys_are_digests_not_ids() {
        let registry = MemoryTicketRegistry::new();
        let tgt = granting_ticket("TGT-1-abc", "casuser");
        registry.add_ticket(&tgt).await.unwrap();

        let partitions = registry.partitions.read();
        let keys: Vec<&String> = partitions[TicketKind::TicketGranting.index()].keys().collect();
        assert_eq!(keys.len(), 1);
        assert_ne!(keys[0], "TGT-1-abc");
    }

    #[tokio::test]
    async fn unknown_prefix_is_absent_but_cannot_be_added() {
        let registry = MemoryTicketRegistry::new();
        assert!(registry.find_ticket("XYZ-1-abc").await.unwrap().is_none());
        assert_eq!(registry.delete_single_ticket("XYZ-1-abc").await.unwrap(), 0);

        let stray = granting_ticket("XYZ-1-abc", "casuser");
        assert!(matches!(
            registry.add_ticket(&stray).await,
            Err(TicketError::UnknownTicketPrefix { .. })
        ));
    }

    #[tokio::test]
    async fn prefix_of_another_kind_is_rejected() {
        let registry = MemoryTicketRegistry::new();
        let mislabelled = granting_ticket("ST-1-abc", "casuser");
        assert!(matches!(
            registry.add_ticket(&mislabelled).await,
            Err(TicketError::TypeMismatch { expected: TicketKind::Service, .. })
        ));
    }

    #[tokio::test]
    async fn failed_mutation_leaves_ticket_untouched() {
        let registry = MemoryTicketRegistry::new();
        let st = service_ticket("ST-1-abc", "https://app.example.org", "TGT-1-abc");
        registry.add_ticket(&st).await.unwrap();

        let result = registry
            .mutate_ticket("ST-1-abc", &|ticket: &mut Ticket| {
                ticket.mark_expired();
                Err(TicketError::invalid("ST-1-abc", crate::error::InvalidReason::Revoked))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(registry.find_ticket("ST-1-abc").await.unwrap(), Some(st));
    }

    #[tokio::test]
    async fn clones_share_state() {
        let registry = MemoryTicketRegistry::new();
        let clone = registry.clone();
        registry.add_ticket(&granting_ticket("TGT-1-abc", "casuser")).await.unwrap();
        assert_eq!(clone.len(), 1);
        assert_eq!(clone.delete_all().await.unwrap(), 1);
        assert!(registry.is_empty());
    }
}
