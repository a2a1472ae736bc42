//! Key/value document style registry.
//!
//! Every ticket is one [`TicketRecord`] with an explicit expiry and its
//! secondary attributes. Two index families let sessions and service tickets
//! be counted without decoding payloads:
//!
//! ```text
//! tickets/<storage_name>/<digest>            -> TicketRecord (JSON)
//! idx/principal/<principal digest>/<digest>  -> IndexEntry   (root TGTs)
//! idx/service/<service hash>/<digest>        -> IndexEntry   (STs and PTs)
//! ```
//!
//! Records and their index entries are always written in one transaction.

use std::{fmt, ops::Bound, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ticketd_storage::{StorageBackend, StorageError, types::prefix_end};
use tracing::debug;

use super::{
    DEFAULT_SCAN_BATCH, TicketMutation, TicketPage, TicketRegistry, live_until, partition_for,
};
use crate::{
    catalog::{TicketCatalog, TicketDefinition},
    clock::{SharedClock, system_clock},
    codec::{TicketCodec, TicketRecord, sha512_hex},
    config::RegistryConfig,
    error::{ConfigError, TicketError, TicketResult},
    ticket::{Expirable, Ticket, TicketKind},
};

const RECORD_ROOT: &str = "tickets/";
const INDEX_ROOT: &str = "idx/";

/// Value stored under a secondary index key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct IndexEntry {
    kind: TicketKind,
    expires_at: DateTime<Utc>,
}

/// [`TicketRegistry`] over a transactional key/value store, with secondary
/// indices by principal and by service.
#[derive(Clone)]
pub struct DocumentTicketRegistry<B> {
    backend: B,
    catalog: TicketCatalog,
    clock: SharedClock,
    codec: TicketCodec,
    config: RegistryConfig,
}

#[bon::bon]
impl<B: StorageBackend> DocumentTicketRegistry<B> {
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
        format!("{RECORD_ROOT}{}/", definition.storage_name).into_bytes()
    }

    fn record_key(definition: &TicketDefinition, digest: &str) -> Vec<u8> {
        let mut key = Self::partition_prefix(definition);
        key.extend_from_slice(digest.as_bytes());
        key
    }

    fn principal_prefix(principal_digest: &str) -> Vec<u8> {
        format!("{INDEX_ROOT}principal/{principal_digest}/").into_bytes()
    }

    fn service_prefix(service: &str) -> Vec<u8> {
        format!("{INDEX_ROOT}service/{}/", sha512_hex(service)).into_bytes()
    }

    /// Index keys a record is filed under.
    fn index_keys(record: &TicketRecord) -> Vec<Vec<u8>> {
        let mut keys = Vec::with_capacity(1);
        if record.kind == TicketKind::TicketGranting {
            if let Some(principal) = &record.principal_digest {
                let mut key = Self::principal_prefix(principal);
                key.extend_from_slice(record.id_digest.as_bytes());
                keys.push(key);
            }
        }
        if let Some(service) = &record.service {
            let mut key = Self::service_prefix(service);
            key.extend_from_slice(record.id_digest.as_bytes());
            keys.push(key);
        }
        keys
    }

    fn encode_record(&self, ticket: &Ticket) -> TicketResult<(TicketRecord, Vec<u8>, Vec<u8>)> {
        let record = self.codec.record(ticket, live_until(&self.config, ticket, self.clock.now()))?;
        let index = IndexEntry { kind: record.kind, expires_at: record.expires_at };
        let record_bytes = encode_json(&record)?;
        let index_bytes = encode_json(&index)?;
        Ok((record, record_bytes, index_bytes))
    }

    fn decode_record(bytes: &[u8]) -> TicketResult<TicketRecord> {
        serde_json::from_slice(bytes).map_err(|e| {
            StorageError::serialization_with_source("failed to decode ticket record", e).into()
        })
    }

    fn locate(&self, id: &str) -> Option<Vec<u8>> {
        let definition = self.catalog.find_by_id(id)?;
        Some(Self::record_key(definition, &self.codec.digest(id)))
    }

    async fn count_live_index_entries(&self, prefix: Vec<u8>) -> TicketResult<usize> {
        let end = prefix_end(&prefix).map_or(Bound::Unbounded, Bound::Excluded);
        let mut start = Bound::Included(prefix);
        let now = self.clock.now();

        let mut live = 0;
        loop {
            let entries = self
                .backend
                .get_range_limited((start.clone(), end.clone()), DEFAULT_SCAN_BATCH)
                .await?;
            for entry in &entries {
                let index: IndexEntry = serde_json::from_slice(&entry.value).map_err(|e| {
                    StorageError::serialization_with_source("failed to decode index entry", e)
                })?;
                if index.expires_at >= now {
                    live += 1;
                }
            }
            match entries.last() {
                Some(last) if entries.len() == DEFAULT_SCAN_BATCH => {
                    start = Bound::Excluded(last.key.to_vec());
                },
                _ => return Ok(live),
            }
        }
    }
}

fn encode_json<T: Serialize>(value: &T) -> TicketResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| {
        StorageError::serialization_with_source("failed to encode ticket record", e).into()
    })
}

fn root_range(root: &str) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
    let start = root.as_bytes().to_vec();
    let end = prefix_end(&start).map_or(Bound::Unbounded, Bound::Excluded);
    (Bound::Included(start), end)
}

impl<B> fmt::Debug for DocumentTicketRegistry<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentTicketRegistry")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<B: StorageBackend> TicketRegistry for DocumentTicketRegistry<B> {
    fn catalog(&self) -> &TicketCatalog {
        &self.catalog
    }

    fn clock(&self) -> SharedClock {
        Arc::clone(&self.clock)
    }

    #[tracing::instrument(skip(self))]
    async fn find_ticket(&self, id: &str) -> TicketResult<Option<Ticket>> {
        let Some(key) = self.locate(id) else {
            return Ok(None);
        };
        match self.backend.get(&key).await? {
            Some(bytes) => Ok(Some(self.codec.ticket_from_record(&Self::decode_record(&bytes)?)?)),
            None => Ok(None),
        }
    }

    #[tracing::instrument(skip(self, ticket), fields(id = %ticket.id(), kind = %ticket.kind()))]
    async fn add_ticket(&self, ticket: &Ticket) -> TicketResult<()> {
        let definition = partition_for(&self.catalog, ticket)?;
        let (record, record_bytes, index_bytes) = self.encode_record(ticket)?;

        let mut txn = self.backend.transaction().await?;
        txn.compare_and_set(Self::record_key(definition, &record.id_digest), None, record_bytes)?;
        for key in Self::index_keys(&record) {
            txn.set(key, index_bytes.clone());
        }
        match txn.commit().await {
            Ok(()) => Ok(()),
            Err(StorageError::Conflict) => Err(TicketError::duplicate(ticket.id())),
            Err(e) => Err(e.into()),
        }
    }

    #[tracing::instrument(skip(self, ticket), fields(id = %ticket.id(), kind = %ticket.kind()))]
    async fn update_ticket(&self, ticket: &Ticket) -> TicketResult<()> {
        let definition = partition_for(&self.catalog, ticket)?;
        let (record, record_bytes, index_bytes) = self.encode_record(ticket)?;

        let mut txn = self.backend.transaction().await?;
        txn.set(Self::record_key(definition, &record.id_digest), record_bytes);
        for key in Self::index_keys(&record) {
            txn.set(key, index_bytes.clone());
        }
        txn.commit().await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn delete_single_ticket(&self, id: &str) -> TicketResult<usize> {
        let Some(key) = self.locate(id) else {
            return Ok(0);
        };
        let Some(bytes) = self.backend.get(&key).await? else {
            return Ok(0);
        };
        let record = Self::decode_record(&bytes)?;

        let mut txn = self.backend.transaction().await?;
        txn.delete(key);
        for index_key in Self::index_keys(&record) {
            txn.delete(index_key);
        }
        txn.commit().await?;
        Ok(1)
    }

    #[tracing::instrument(skip(self))]
    async fn delete_all(&self) -> TicketResult<usize> {
        let removed = self.backend.get_range(root_range(RECORD_ROOT)).await?.len();
        self.backend.clear_range(root_range(RECORD_ROOT)).await?;
        self.backend.clear_range(root_range(INDEX_ROOT)).await?;
        Ok(removed)
    }

    #[tracing::instrument(skip(self, mutation))]
    async fn mutate_ticket(
        &self,
        id: &str,
        mutation: &TicketMutation<'_>,
    ) -> TicketResult<Option<Ticket>> {
        let Some(key) = self.locate(id) else {
            return Ok(None);
        };

        for attempt in 1..=self.config.cas_attempts {
            let Some(current) = self.backend.get(&key).await? else {
                return Ok(None);
            };
            let mut ticket = self.codec.ticket_from_record(&Self::decode_record(&current)?)?;
            mutation(&mut ticket)?;
            let (record, record_bytes, index_bytes) = self.encode_record(&ticket)?;

            let mut txn = self.backend.transaction().await?;
            txn.compare_and_set(key.clone(), Some(current.to_vec()), record_bytes)?;
            for index_key in Self::index_keys(&record) {
                txn.set(index_key, index_bytes.clone());
            }
            match txn.commit().await {
                Ok(()) => return Ok(Some(ticket)),
                Err(StorageError::Conflict) => {
                    debug!(attempt, "concurrent update, re-reading record");
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
            Some(cursor) => Bound::Excluded(Self::record_key(self.catalog.definition(kind), cursor)),
            None => Bound::Included(prefix.clone()),
        };
        let end = prefix_end(&prefix).map_or(Bound::Unbounded, Bound::Excluded);

        let entries = self.backend.get_range_limited((start, end), limit).await?;
        let mut page = TicketPage::default();
        let mut last_digest = None;
        for entry in &entries {
            let record = Self::decode_record(&entry.value)?;
            page.tickets.push(self.codec.ticket_from_record(&record)?);
            last_digest = Some(record.id_digest);
        }
        if entries.len() == limit {
            page.next_cursor = last_digest;
        }
        Ok(page)
    }

    #[tracing::instrument(skip(self))]
    async fn count_sessions_for(&self, principal: &str) -> TicketResult<usize> {
        self.count_live_index_entries(Self::principal_prefix(&self.codec.digest(principal))).await
    }

    #[tracing::instrument(skip(self))]
    async fn count_tickets_for(&self, service: &str) -> TicketResult<usize> {
        self.count_live_index_entries(Self::service_prefix(service)).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use ticketd_storage::MemoryBackend;

    use super::*;
    use crate::testutil::{ManualClock, granting_ticket, service_ticket};

    fn registry(clock: &ManualClock) -> DocumentTicketRegistry<MemoryBackend> {
        DocumentTicketRegistry::builder()
            .backend(MemoryBackend::new())
            .clock(clock.shared())
            .build()
            .unwrap()
    }

    async fn keys_under(registry: &DocumentTicketRegistry<MemoryBackend>, root: &str) -> Vec<String> {
        registry
            .backend()
            .get_range(root_range(root))
            .await
            .unwrap()
            .into_iter()
            .map(|kv| String::from_utf8_lossy(&kv.key).into_owned())
            .collect()
    }

    #[tokio::test]
    async fn records_and_indices_are_written_together() {
        let clock = ManualClock::default();
        let registry = registry(&clock);
        registry.add_ticket(&granting_ticket("TGT-1-abc", "casuser")).await.unwrap();
        registry
            .add_ticket(&service_ticket("ST-1-abc", "https://app.example.org", "TGT-1-abc"))
            .await
            .unwrap();

        let records = keys_under(&registry, RECORD_ROOT).await;
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|key| !key.contains("TGT-1-abc") && !key.contains("ST-1-abc")));

        let indices = keys_under(&registry, INDEX_ROOT).await;
        assert_eq!(indices.len(), 2);
        assert!(indices.iter().any(|key| key.starts_with("idx/principal/")));
        assert!(indices.iter().any(|key| key.starts_with("idx/service/")));
    }

    #[tokio::test]
    async fn single_delete_removes_index_entries() {
        let clock = ManualClock::default();
        let registry = registry(&clock);
        registry.add_ticket(&granting_ticket("TGT-1-abc", "casuser")).await.unwrap();

        assert_eq!(registry.delete_single_ticket("TGT-1-abc").await.unwrap(), 1);
        assert!(keys_under(&registry, INDEX_ROOT).await.is_empty());
        assert_eq!(registry.count_sessions_for("casuser").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn index_counts_ignore_expired_entries() {
        let clock = ManualClock::default();
        let registry = registry(&clock);
        registry
            .add_ticket(&service_ticket("ST-1-abc", "https://app.example.org", "TGT-1-abc"))
            .await
            .unwrap();
        assert_eq!(registry.count_tickets_for("https://app.example.org").await.unwrap(), 1);

        clock.advance(Duration::from_secs(60));
        assert_eq!(registry.count_tickets_for("https://app.example.org").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn delete_all_clears_indices() {
        let clock = ManualClock::default();
        let registry = registry(&clock);
        registry.add_ticket(&granting_ticket("TGT-1-abc", "casuser")).await.unwrap();
        registry.add_ticket(&granting_ticket("TGT-2-abc", "casuser")).await.unwrap();

        assert_eq!(registry.delete_all().await.unwrap(), 2);
        assert!(keys_under(&registry, INDEX_ROOT).await.is_empty());
    }
}
