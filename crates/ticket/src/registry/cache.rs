//! Distributed-cache style registry.
//!
//! Each ticket is one key, `<storage_name>:<digest>`, holding the sealed
//! payload with a native TTL derived from the ticket's expiration policy.
//! There are no secondary indices; cascading revocation follows the child
//! ids recorded on granting tickets, and counting falls back to scanning.
//!
//! Read-modify-write is a compare-and-set loop on the sealed bytes, bounded
//! by [`RegistryConfig::cas_attempts`].

use std::{fmt, ops::Bound, sync::Arc, time::Duration};

use async_trait::async_trait;
use ticketd_storage::{StorageBackend, StorageError, types::prefix_end};
use tracing::debug;

use super::{TicketMutation, TicketPage, TicketRegistry, partition_for};
use crate::{
    catalog::{TicketCatalog, TicketDefinition},
    clock::{SharedClock, system_clock},
    codec::TicketCodec,
    config::RegistryConfig,
    error::{ConfigError, TicketError, TicketResult},
    ticket::{Expirable, Ticket, TicketKind},
};

/// Shortest native TTL handed to the backend.
///
/// Several caches read a zero TTL as "never expire", so an already-expired
/// ticket is kept briefly instead and filtered at read time.
pub const MIN_NATIVE_TTL: Duration = Duration::from_secs(1);

/// [`TicketRegistry`] over a key/value cache with per-key TTL.
#[derive(Clone)]
pub struct CacheTicketRegistry<B> {
    backend: B,
    catalog: TicketCatalog,
    clock: SharedClock,
    codec: TicketCodec,
    config: RegistryConfig,
}

#[bon::bon]
impl<B: StorageBackend> CacheTicketRegistry<B> {
    /// Creates a registry over `backend`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `config` fails validation.
    #[builder]
    pub fn new(
        backend: B,
        #[builder(default)] catalog: TicketCatalog,
        #[builder(default = system_clock())] clock: SharedClock,
        #[builder(default)] codec: TicketCodec,
        #[builder(default)] config: RegistryConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { backend, catalog, clock, codec, config })
    }

    /// The underlying backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn partition_prefix(definition: &TicketDefinition) -> Vec<u8> {
        format!("{}:", definition.storage_name).into_bytes()
    }

    fn key_in(&self, definition: &TicketDefinition, id: &str) -> Vec<u8> {
        let mut key = Self::partition_prefix(definition);
        key.extend_from_slice(self.codec.digest(id).as_bytes());
        key
    }

    fn key_for(&self, id: &str) -> Option<Vec<u8>> {
        self.catalog.find_by_id(id).map(|definition| self.key_in(definition, id))
    }

    fn native_ttl(&self, ticket: &Ticket) -> Duration {
        self.config.capped_ttl(ticket.time_to_live(self.clock.now())).max(MIN_NATIVE_TTL)
    }
}

impl<B> fmt::Debug for CacheTicketRegistry<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheTicketRegistry")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<B: StorageBackend> TicketRegistry for CacheTicketRegistry<B> {
    fn catalog(&self) -> &TicketCatalog {
        &self.catalog
    }

    fn clock(&self) -> SharedClock {
        Arc::clone(&self.clock)
    }

    #[tracing::instrument(skip(self))]
    async fn find_ticket(&self, id: &str) -> TicketResult<Option<Ticket>> {
        let Some(key) = self.key_for(id) else {
            return Ok(None);
        };
        match self.backend.get(&key).await? {
            Some(sealed) => Ok(Some(self.codec.open(&sealed)?)),
            None => Ok(None),
        }
    }

    #[tracing::instrument(skip(self, ticket), fields(id = %ticket.id(), kind = %ticket.kind()))]
    async fn add_ticket(&self, ticket: &Ticket) -> TicketResult<()> {
        let definition = partition_for(&self.catalog, ticket)?;
        let key = self.key_in(definition, ticket.id());
        let sealed = self.codec.seal(ticket)?;

        match self
            .backend
            .compare_and_set(&key, None, sealed, Some(self.native_ttl(ticket)))
            .await
        {
            Ok(()) => Ok(()),
            Err(StorageError::Conflict) => Err(TicketError::duplicate(ticket.id())),
            Err(e) => Err(e.into()),
        }
    }

    #[tracing::instrument(skip(self, ticket), fields(id = %ticket.id(), kind = %ticket.kind()))]
    async fn update_ticket(&self, ticket: &Ticket) -> TicketResult<()> {
        let definition = partition_for(&self.catalog, ticket)?;
        let key = self.key_in(definition, ticket.id());
        let sealed = self.codec.seal(ticket)?;
        self.backend.set_with_ttl(key, sealed, self.native_ttl(ticket)).await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn delete_single_ticket(&self, id: &str) -> TicketResult<usize> {
        let Some(key) = self.key_for(id) else {
            return Ok(0);
        };
        if self.backend.get(&key).await?.is_none() {
            return Ok(0);
        }
        self.backend.delete(&key).await?;
        Ok(1)
    }

    #[tracing::instrument(skip(self))]
    async fn delete_all(&self) -> TicketResult<usize> {
        let mut removed = 0;
        for definition in self.catalog.definitions() {
            let start = Self::partition_prefix(definition);
            let end = prefix_end(&start).map_or(Bound::Unbounded, Bound::Excluded);
            let range = (Bound::Included(start), end);
            removed += self.backend.get_range(range.clone()).await?.len();
            self.backend.clear_range(range).await?;
        }
        Ok(removed)
    }

    #[tracing::instrument(skip(self, mutation))]
    async fn mutate_ticket(
        &self,
        id: &str,
        mutation: &TicketMutation<'_>,
    ) -> TicketResult<Option<Ticket>> {
        let Some(key) = self.key_for(id) else {
            return Ok(None);
        };

        for attempt in 1..=self.config.cas_attempts {
            let Some(current) = self.backend.get(&key).await? else {
                return Ok(None);
            };
            let mut ticket = self.codec.open(&current)?;
            mutation(&mut ticket)?;
            let sealed = self.codec.seal(&ticket)?;

            match self
                .backend
                .compare_and_set(&key, Some(&current), sealed, Some(self.native_ttl(&ticket)))
                .await
            {
                Ok(()) => return Ok(Some(ticket)),
                Err(StorageError::Conflict) => {
                    debug!(attempt, "concurrent update, re-reading ticket");
                },
                Err(e) => return Err(e.into()),
            }
        }
        Err(StorageError::conflict().into())
    }

    #[tracing::instrument(skip(self))]
    async fn scan_tickets(
        &self,
        kind: TicketKind,
        cursor: Option<&str>,
        limit: usize,
    ) -> TicketResult<TicketPage> {
        let limit = limit.max(1);
        let prefix = Self::partition_prefix(self.catalog.definition(kind));
        let start = match cursor {
            Some(cursor) => {
                let mut after = prefix.clone();
                after.extend_from_slice(cursor.as_bytes());
                Bound::Excluded(after)
            },
            None => Bound::Included(prefix.clone()),
        };
        let end = prefix_end(&prefix).map_or(Bound::Unbounded, Bound::Excluded);

        let entries = self.backend.get_range_limited((start, end), limit).await?;
        let mut page = TicketPage::default();
        for entry in &entries {
            page.tickets.push(self.codec.open(&entry.value)?);
        }
        if entries.len() == limit {
            page.next_cursor = entries
                .last()
                .map(|entry| String::from_utf8_lossy(&entry.key[prefix.len()..]).into_owned());
        }
        Ok(page)
    }
}
