//! Cleaners on different nodes sharing one registry take turns through the
//! cleanup lock.

#![allow(clippy::expect_used)]

use std::sync::Arc;

use async_trait::async_trait;
use ticketd_storage::MemoryBackend;
use ticketd_ticket::{
    LockingStrategy, MemoryTicketRegistry, SharedClock, StorageLockingStrategy, Ticket,
    TicketCatalog, TicketKind, TicketMutation, TicketPage, TicketRegistry, TicketRegistryCleaner,
    TicketResult,
    testutil::{ManualClock, TEST_SERVICE, granting_ticket, service_ticket},
};
use tokio::sync::{Notify, watch};

/// Holds every scan until the gate opens, and signals when a sweep arrives.
#[derive(Debug)]
struct GatedRegistry {
    inner: MemoryTicketRegistry,
    entered: Arc<Notify>,
    gate: watch::Receiver<bool>,
}

#[async_trait]
impl TicketRegistry for GatedRegistry {
    fn catalog(&self) -> &TicketCatalog {
        self.inner.catalog()
    }

    fn clock(&self) -> SharedClock {
        self.inner.clock()
    }

    async fn find_ticket(&self, id: &str) -> TicketResult<Option<Ticket>> {
        self.inner.find_ticket(id).await
    }

    async fn add_ticket(&self, ticket: &Ticket) -> TicketResult<()> {
        self.inner.add_ticket(ticket).await
    }

    async fn update_ticket(&self, ticket: &Ticket) -> TicketResult<()> {
        self.inner.update_ticket(ticket).await
    }

    async fn delete_single_ticket(&self, id: &str) -> TicketResult<usize> {
        self.inner.delete_single_ticket(id).await
    }

    async fn delete_all(&self) -> TicketResult<usize> {
        self.inner.delete_all().await
    }

    async fn mutate_ticket(
        &self,
        id: &str,
        mutation: &TicketMutation<'_>,
    ) -> TicketResult<Option<Ticket>> {
        self.inner.mutate_ticket(id, mutation).await
    }

    async fn scan_tickets(
        &self,
        kind: TicketKind,
        cursor: Option<&str>,
        limit: usize,
    ) -> TicketResult<TicketPage> {
        self.entered.notify_one();
        let mut gate = self.gate.clone();
        let _ = gate.wait_for(|open| *open).await;
        self.inner.scan_tickets(kind, cursor, limit).await
    }
}

fn node_lock(backend: &MemoryBackend, holder: &str) -> Arc<dyn LockingStrategy> {
    Arc::new(StorageLockingStrategy::builder().backend(backend.clone()).holder(holder).build())
}

#[tokio::test]
async fn second_cleaner_skips_while_the_first_is_sweeping() {
    let clock = ManualClock::default();
    let inner = MemoryTicketRegistry::builder().clock(clock.shared()).build();
    inner.add_ticket(&granting_ticket("TGT-1-a", "casuser")).await.expect("add");
    for n in 1..=3 {
        let st = service_ticket(&format!("ST-{n}-a"), TEST_SERVICE, "TGT-1-a");
        inner.add_ticket(&st).await.expect("add");
    }
    clock.advance(std::time::Duration::from_secs(30));

    let entered = Arc::new(Notify::new());
    let (open_gate, gate) = watch::channel(false);
    let registry: Arc<dyn TicketRegistry> =
        Arc::new(GatedRegistry { inner: inner.clone(), entered: Arc::clone(&entered), gate });

    let locks = MemoryBackend::new();
    let node_a = Arc::new(
        TicketRegistryCleaner::builder()
            .registry(Arc::clone(&registry))
            .locking(node_lock(&locks, "node-a"))
            .build(),
    );
    let node_b = TicketRegistryCleaner::builder()
        .registry(Arc::clone(&registry))
        .locking(node_lock(&locks, "node-b"))
        .build();

    let sweeping = tokio::spawn({
        let node_a = Arc::clone(&node_a);
        async move { node_a.clean().await }
    });
    entered.notified().await;

    let skipped = node_b.clean().await;
    assert!(skipped.skipped, "node-b swept while node-a held the lock: {skipped:?}");
    assert_eq!(skipped.examined, 0);
    assert_eq!(inner.len(), 4);

    open_gate.send(true).expect("gate receiver alive");
    let swept = sweeping.await.expect("sweep task");
    assert!(!swept.skipped);
    assert_eq!(swept.removed, 3);
    assert_eq!(inner.len(), 1);

    let after = node_b.clean().await;
    assert!(!after.skipped, "the lock is free once node-a finishes");
    assert_eq!(after.removed, 0);
}
