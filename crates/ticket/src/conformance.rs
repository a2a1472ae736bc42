//! Conformance suite for [`TicketRegistry`] implementations.
//!
//! Every adapter must behave identically at the registry boundary: same
//! not-found and type-mismatch semantics, same expiry filtering, same atomic
//! read-modify-write. Each function here checks one aspect against a fresh,
//! empty registry.
//!
//! Registries must be built on the [`ManualClock`] passed to the functions
//! that take one (fixtures are created at [`test_epoch`]).
//!
//! # Usage
//!
//! ```no_run
//! use ticketd_ticket::{MemoryTicketRegistry, conformance, testutil::ManualClock};
//!
//! #[tokio::test]
//! async fn round_trip() {
//!     let clock = ManualClock::default();
//!     let registry = MemoryTicketRegistry::builder().clock(clock.shared()).build();
//!     conformance::round_trip_preserves_every_field(&registry).await;
//! }
//! ```
//!
//! | Category | Contract aspect |
//! |----------|-----------------|
//! | CRUD | Round trip, duplicates, upsert, idempotent delete |
//! | Lookup | Type mismatch vs. not found, expiry filtering |
//! | Atomicity | Single winner, failed mutation writes nothing |
//! | Cascade | Granting tickets take their descendants with them |
//! | Enumeration | Batched scan, predicate queries, counting |

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use crate::{
    assert_invalid_ticket,
    error::{InvalidReason, TicketError},
    registry::TicketRegistry,
    testutil::{
        BACKEND_SERVICE, ManualClock, PROXY_SERVICE, TEST_SERVICE, granting_ticket,
        proxy_granting_ticket, proxy_ticket, service_ticket, test_epoch,
    },
    ticket::{Consumable, Expirable, Ticket, TicketKind},
};

fn consume(ticket: &mut Ticket) -> crate::TicketResult<()> {
    let id = ticket.id().to_owned();
    let st = ticket
        .as_service_mut()
        .ok_or_else(|| TicketError::invalid(&id, InvalidReason::WrongType))?;
    if !st.consume(test_epoch()) {
        return Err(TicketError::invalid(id, InvalidReason::AlreadyUsed));
    }
    Ok(())
}

// ============================================================================
// CRUD
// ============================================================================

/// `add` then `get` returns a ticket equal in every field.
pub async fn round_trip_preserves_every_field<R: TicketRegistry>(registry: &R) {
    let mut tgt = granting_ticket("TGT-1-roundtrip", "casuser");
    if let Some(granting) = tgt.as_granting_mut() {
        granting.authentication.principal.attributes.insert(
            "memberOf".to_owned(),
            vec!["staff".to_owned(), "admins".to_owned()],
        );
        granting.record_service("ST-1-roundtrip", TEST_SERVICE);
        granting.proxy_granting_tickets.insert("PGT-1-roundtrip".to_owned());
    }
    let st = service_ticket("ST-1-roundtrip", TEST_SERVICE, "TGT-1-roundtrip");
    let pgt =
        proxy_granting_ticket("PGT-1-roundtrip", "casuser", "ST-1-roundtrip", "TGT-1-roundtrip");
    let pt = proxy_ticket("PT-1-roundtrip", BACKEND_SERVICE, "PGT-1-roundtrip");

    for ticket in [&tgt, &st, &pgt, &pt] {
        registry.add_ticket(ticket).await.expect("add");
        let stored = registry.get_ticket(ticket.id()).await.expect("get");
        assert_eq!(stored.as_ref(), Some(ticket), "{} should round-trip", ticket.id());
    }
}

/// Adding an id twice fails with `DuplicateTicket` and keeps the original.
pub async fn duplicate_add_is_rejected<R: TicketRegistry>(registry: &R) {
    let original = granting_ticket("TGT-1-dup", "casuser");
    registry.add_ticket(&original).await.expect("first add");

    let impostor = granting_ticket("TGT-1-dup", "mallory");
    let result = registry.add_ticket(&impostor).await;
    assert!(
        matches!(result, Err(TicketError::DuplicateTicket { ref id }) if id == "TGT-1-dup"),
        "expected DuplicateTicket, got {result:?}"
    );
    assert_eq!(registry.get_ticket("TGT-1-dup").await.expect("get"), Some(original));
}

/// `update` overwrites an existing ticket and inserts a missing one.
pub async fn update_is_upsert<R: TicketRegistry>(registry: &R) {
    let mut tgt = granting_ticket("TGT-1-upsert", "casuser");
    registry.update_ticket(&tgt).await.expect("insert via update");
    assert_eq!(registry.get_ticket("TGT-1-upsert").await.expect("get").as_ref(), Some(&tgt));

    if let Some(granting) = tgt.as_granting_mut() {
        granting.record_service("ST-9-upsert", TEST_SERVICE);
    }
    registry.update_ticket(&tgt).await.expect("overwrite via update");
    let stored = registry.get_ticket("TGT-1-upsert").await.expect("get").expect("present");
    assert_eq!(stored.descendant_ids(), vec!["ST-9-upsert".to_owned()]);
}

/// Deleting a missing id returns 0, never an error.
pub async fn delete_is_idempotent<R: TicketRegistry>(registry: &R) {
    assert_eq!(registry.delete_ticket("ST-1-never").await.expect("delete missing"), 0);

    registry
        .add_ticket(&service_ticket("ST-1-once", TEST_SERVICE, "TGT-1-once"))
        .await
        .expect("add");
    assert_eq!(registry.delete_ticket("ST-1-once").await.expect("delete"), 1);
    assert_eq!(registry.delete_ticket("ST-1-once").await.expect("delete again"), 0);
    assert_eq!(registry.delete_single_ticket("ST-1-once").await.expect("single again"), 0);
    assert_eq!(registry.get_ticket("ST-1-once").await.expect("get"), None);
}

/// `delete_all` removes everything and reports how much.
pub async fn delete_all_empties_the_registry<R: TicketRegistry>(registry: &R) {
    registry.add_ticket(&granting_ticket("TGT-1-all", "casuser")).await.expect("add");
    registry
        .add_ticket(&service_ticket("ST-1-all", TEST_SERVICE, "TGT-1-all"))
        .await
        .expect("add");
    registry
        .add_ticket(&service_ticket("ST-2-all", TEST_SERVICE, "TGT-1-all"))
        .await
        .expect("add");

    assert_eq!(registry.delete_all().await.expect("delete all"), 3);
    assert!(registry.get_tickets(&|_: &Ticket| true).await.expect("enumerate").is_empty());
    assert_eq!(registry.delete_all().await.expect("delete all again"), 0);
}

// ============================================================================
// Lookup
// ============================================================================

/// Asking for the wrong kind fails distinctly from asking for a missing id.
pub async fn typed_lookup_distinguishes_mismatch_from_missing<R: TicketRegistry>(registry: &R) {
    registry
        .add_ticket(&service_ticket("ST-1-typed", TEST_SERVICE, "TGT-1-typed"))
        .await
        .expect("add");

    let mismatch = registry.get_typed_ticket("ST-1-typed", TicketKind::TicketGranting).await;
    assert!(
        matches!(
            mismatch,
            Err(TicketError::TypeMismatch {
                expected: TicketKind::TicketGranting,
                actual: TicketKind::Service,
                ..
            })
        ),
        "expected TypeMismatch, got {mismatch:?}"
    );

    let missing = registry.get_typed_ticket("TGT-1-typed", TicketKind::TicketGranting).await;
    assert!(matches!(missing, Ok(None)), "expected Ok(None), got {missing:?}");

    let found = registry.get_typed_ticket("ST-1-typed", TicketKind::Service).await.expect("get");
    assert!(found.is_some());

    let filtered = registry
        .get_ticket_matching("ST-1-typed", TicketKind::Service, &|t: &Ticket| {
            t.service_id() == Some(PROXY_SERVICE)
        })
        .await
        .expect("predicate lookup");
    assert!(filtered.is_none(), "predicate should filter the ticket out");
}

/// A PT satisfies a request for a service ticket; an ST does not satisfy a
/// request for a proxy ticket.
pub async fn broader_kind_accepts_narrower<R: TicketRegistry>(registry: &R) {
    registry
        .add_ticket(&proxy_ticket("PT-1-broad", BACKEND_SERVICE, "PGT-1-broad"))
        .await
        .expect("add");
    registry
        .add_ticket(&service_ticket("ST-1-broad", TEST_SERVICE, "TGT-1-broad"))
        .await
        .expect("add");

    assert!(registry.get_typed_ticket("PT-1-broad", TicketKind::Service).await.expect("get").is_some());
    assert!(matches!(
        registry.get_typed_ticket("ST-1-broad", TicketKind::Proxy).await,
        Err(TicketError::TypeMismatch { .. })
    ));
}

/// Expired tickets are never returned by the filtered reads.
pub async fn expired_tickets_are_hidden<R: TicketRegistry>(registry: &R, clock: &ManualClock) {
    registry.add_ticket(&granting_ticket("TGT-1-exp", "casuser")).await.expect("add");
    registry
        .add_ticket(&service_ticket("ST-1-exp", TEST_SERVICE, "TGT-1-exp"))
        .await
        .expect("add");
    assert!(registry.get_ticket("ST-1-exp").await.expect("get").is_some());

    // Past the 10s service ticket lifetime, well inside the TGT idle timeout.
    clock.advance(Duration::from_secs(11));

    assert_eq!(registry.get_ticket("ST-1-exp").await.expect("get"), None);
    assert_eq!(registry.get_typed_ticket("ST-1-exp", TicketKind::Service).await.expect("get"), None);
    let live = registry.get_tickets(&|_: &Ticket| true).await.expect("enumerate");
    assert_eq!(live.iter().map(|t| t.id().to_owned()).collect::<Vec<_>>(), vec!["TGT-1-exp"]);
    assert_eq!(registry.count_tickets_for(TEST_SERVICE).await.expect("count"), 0);
}

/// A ticket explicitly marked expired is hidden even though its policy is not.
pub async fn marked_expired_ticket_is_hidden<R: TicketRegistry>(registry: &R) {
    let mut tgt = granting_ticket("TGT-1-marked", "casuser");
    tgt.mark_expired();
    registry.add_ticket(&tgt).await.expect("add");

    assert_eq!(registry.get_ticket("TGT-1-marked").await.expect("get"), None);
    assert_eq!(registry.count_sessions_for("casuser").await.expect("count"), 0);
}

// ============================================================================
// Atomicity
// ============================================================================

/// Concurrent consumers of one service ticket: exactly one wins.
pub async fn mutate_has_single_winner<R: TicketRegistry + 'static>(registry: Arc<R>) {
    registry
        .add_ticket(&service_ticket("ST-1-race", TEST_SERVICE, "TGT-1-race"))
        .await
        .expect("add");

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..8 {
        let registry = Arc::clone(&registry);
        tasks.spawn(async move { registry.mutate_ticket("ST-1-race", &consume).await });
    }

    let mut winners = 0;
    while let Some(result) = tasks.join_next().await {
        match result.expect("task should not panic") {
            Ok(Some(ticket)) => {
                assert!(ticket.as_service().is_some_and(|st| st.used));
                winners += 1;
            },
            Ok(None) => panic!("ticket vanished during the race"),
            Err(error) => assert_eq!(error.invalid_reason(), Some(InvalidReason::AlreadyUsed)),
        }
    }
    assert_eq!(winners, 1, "exactly one consumer should win");
}

/// A failing mutation leaves the stored ticket unchanged; a missing id yields `None`.
pub async fn failed_mutation_writes_nothing<R: TicketRegistry>(registry: &R) {
    let st = service_ticket("ST-1-abort", TEST_SERVICE, "TGT-1-abort");
    registry.add_ticket(&st).await.expect("add");

    registry.mutate_ticket("ST-1-abort", &consume).await.expect("first consume");
    let second = registry.mutate_ticket("ST-1-abort", &consume).await;
    assert_invalid_ticket!(second, AlreadyUsed);

    let stored = registry.find_ticket("ST-1-abort").await.expect("find").expect("present");
    assert_eq!(stored.meta().count_of_uses, 1);

    let missing = registry.mutate_ticket("ST-1-nowhere", &consume).await.expect("mutate missing");
    assert!(missing.is_none());
}

/// Concurrent child appends on one granting ticket are all kept.
pub async fn concurrent_child_appends_are_kept<R: TicketRegistry + 'static>(registry: Arc<R>) {
    registry.add_ticket(&granting_ticket("TGT-1-tabs", "casuser")).await.expect("add");

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..8 {
        let registry = Arc::clone(&registry);
        tasks.spawn(async move {
            let child = format!("ST-{i}-tabs");
            let record = move |ticket: &mut Ticket| -> crate::TicketResult<()> {
                if let Some(granting) = ticket.as_granting_mut() {
                    granting.record_service(child.clone(), TEST_SERVICE);
                }
                Ok(())
            };
            registry.mutate_ticket("TGT-1-tabs", &record).await
        });
    }
    while let Some(result) = tasks.join_next().await {
        result.expect("task should not panic").expect("append");
    }

    let tgt = registry.get_ticket("TGT-1-tabs").await.expect("get").expect("present");
    assert_eq!(tgt.descendant_ids().len(), 8, "no sibling grant may be lost");
}

// ============================================================================
// Cascade
// ============================================================================

/// Deleting a TGT removes its STs, its PGTs and their PTs.
pub async fn delete_cascades_to_descendants<R: TicketRegistry>(registry: &R) {
    let mut tgt = granting_ticket("TGT-1-tree", "casuser");
    let mut pgt = proxy_granting_ticket("PGT-1-tree", "casuser", "ST-1-tree", "TGT-1-tree");
    if let Some(granting) = tgt.as_granting_mut() {
        granting.record_service("ST-1-tree", PROXY_SERVICE);
        granting.record_service("ST-2-tree", TEST_SERVICE);
        granting.proxy_granting_tickets.insert("PGT-1-tree".to_owned());
    }
    if let Some(granting) = pgt.as_granting_mut() {
        granting.record_service("PT-1-tree", BACKEND_SERVICE);
    }
    for ticket in [
        tgt,
        service_ticket("ST-1-tree", PROXY_SERVICE, "TGT-1-tree"),
        service_ticket("ST-2-tree", TEST_SERVICE, "TGT-1-tree"),
        pgt,
        proxy_ticket("PT-1-tree", BACKEND_SERVICE, "PGT-1-tree"),
    ] {
        registry.add_ticket(&ticket).await.expect("add");
    }
    registry.add_ticket(&granting_ticket("TGT-2-tree", "casuser")).await.expect("add bystander");

    assert_eq!(registry.delete_ticket("TGT-1-tree").await.expect("delete"), 5);
    for id in ["TGT-1-tree", "ST-1-tree", "ST-2-tree", "PGT-1-tree", "PT-1-tree"] {
        assert!(registry.find_ticket(id).await.expect("find").is_none(), "{id} should be gone");
    }
    assert!(registry.get_ticket("TGT-2-tree").await.expect("get").is_some());
}

// ============================================================================
// Enumeration
// ============================================================================

/// Paging through a kind visits every ticket exactly once.
pub async fn scan_pages_cover_every_ticket<R: TicketRegistry>(registry: &R) {
    let mut expected = BTreeSet::new();
    for i in 0..7 {
        let id = format!("ST-{i}-scan");
        registry.add_ticket(&service_ticket(&id, TEST_SERVICE, "TGT-1-scan")).await.expect("add");
        expected.insert(id);
    }
    registry.add_ticket(&granting_ticket("TGT-1-scan", "casuser")).await.expect("add");

    let mut seen = BTreeSet::new();
    let mut cursor: Option<String> = None;
    let mut pages = 0;
    loop {
        let page = registry
            .scan_tickets(TicketKind::Service, cursor.as_deref(), 3)
            .await
            .expect("scan");
        assert!(page.tickets.len() <= 3);
        pages += 1;
        for ticket in page.tickets {
            assert_eq!(ticket.kind(), TicketKind::Service);
            assert!(seen.insert(ticket.id().to_owned()), "{} seen twice", ticket.id());
        }
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
        assert!(pages < 10, "scan did not terminate");
    }
    assert_eq!(seen, expected);

    let all = registry.get_tickets(&|t: &Ticket| t.kind() == TicketKind::Service).await.expect("enumerate");
    assert_eq!(all.len(), 7);
}

/// Session and service counts include only live tickets of the right owner.
pub async fn counts_follow_principal_and_service<R: TicketRegistry>(registry: &R, clock: &ManualClock) {
    registry.add_ticket(&granting_ticket("TGT-1-count", "casuser")).await.expect("add");
    registry.add_ticket(&granting_ticket("TGT-2-count", "casuser")).await.expect("add");
    registry.add_ticket(&granting_ticket("TGT-3-count", "someone")).await.expect("add");
    registry
        .add_ticket(&proxy_granting_ticket("PGT-1-count", "casuser", "ST-1-count", "TGT-1-count"))
        .await
        .expect("add");
    registry
        .add_ticket(&service_ticket("ST-1-count", TEST_SERVICE, "TGT-1-count"))
        .await
        .expect("add");
    registry
        .add_ticket(&service_ticket("ST-2-count", TEST_SERVICE, "TGT-2-count"))
        .await
        .expect("add");
    registry
        .add_ticket(&proxy_ticket("PT-1-count", TEST_SERVICE, "PGT-1-count"))
        .await
        .expect("add");
    registry
        .add_ticket(&service_ticket("ST-3-count", PROXY_SERVICE, "TGT-3-count"))
        .await
        .expect("add");

    assert_eq!(registry.count_sessions_for("casuser").await.expect("count"), 2);
    assert_eq!(registry.count_sessions_for("someone").await.expect("count"), 1);
    assert_eq!(registry.count_sessions_for("nobody").await.expect("count"), 0);
    assert_eq!(registry.count_tickets_for(TEST_SERVICE).await.expect("count"), 3);
    assert_eq!(registry.count_tickets_for(PROXY_SERVICE).await.expect("count"), 1);

    clock.advance(Duration::from_secs(60));
    assert_eq!(registry.count_tickets_for(TEST_SERVICE).await.expect("count"), 0);
    assert_eq!(registry.count_sessions_for("casuser").await.expect("count"), 2);
}

/// Counts and lookups agree on the exact instant a ticket stops being live.
pub async fn counts_agree_with_lookup_at_the_deadline<R: TicketRegistry>(
    registry: &R,
    clock: &ManualClock,
) {
    registry.add_ticket(&granting_ticket("TGT-1-edge", "casuser")).await.expect("add");
    registry
        .add_ticket(&service_ticket("ST-1-edge", TEST_SERVICE, "TGT-1-edge"))
        .await
        .expect("add");

    clock.advance(Duration::from_secs(10));
    assert!(registry.get_ticket("ST-1-edge").await.expect("get").is_some());
    assert_eq!(registry.count_tickets_for(TEST_SERVICE).await.expect("count"), 1);

    clock.advance(Duration::from_millis(1));
    assert_eq!(registry.get_ticket("ST-1-edge").await.expect("get"), None);
    assert_eq!(registry.count_tickets_for(TEST_SERVICE).await.expect("count"), 0);
}
