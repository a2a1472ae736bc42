//! Runs the registry conformance suite and engine scenarios against
//! `SqlTicketRegistry`.

#![allow(clippy::expect_used, clippy::panic)]

use std::sync::Arc;

use rusqlite::Connection;
use ticketd_ticket::{
    InvalidReason, LockingStrategy, TicketError, TicketRegistry, TicketRegistryCleaner,
    TicketService, conformance,
    testutil::{ManualClock, TEST_SERVICE, sample_authentication, service_ticket, test_services},
};
use ticketd_ticket_sql::SqlTicketRegistry;

fn sql(clock: &ManualClock) -> SqlTicketRegistry {
    SqlTicketRegistry::builder()
        .connection(Connection::open_in_memory().expect("open in-memory database"))
        .clock(clock.shared())
        .build()
        .expect("sql registry")
}

#[tokio::test]
async fn round_trip_preserves_every_field() {
    let clock = ManualClock::default();
    conformance::round_trip_preserves_every_field(&sql(&clock)).await;
}

#[tokio::test]
async fn duplicate_add_is_rejected() {
    let clock = ManualClock::default();
    conformance::duplicate_add_is_rejected(&sql(&clock)).await;
}

#[tokio::test]
async fn update_is_upsert() {
    let clock = ManualClock::default();
    conformance::update_is_upsert(&sql(&clock)).await;
}

#[tokio::test]
async fn delete_is_idempotent() {
    let clock = ManualClock::default();
    conformance::delete_is_idempotent(&sql(&clock)).await;
}

#[tokio::test]
async fn delete_all_empties_the_registry() {
    let clock = ManualClock::default();
    conformance::delete_all_empties_the_registry(&sql(&clock)).await;
}

#[tokio::test]
async fn typed_lookup_distinguishes_mismatch_from_missing() {
    let clock = ManualClock::default();
    conformance::typed_lookup_distinguishes_mismatch_from_missing(&sql(&clock)).await;
}

#[tokio::test]
async fn broader_kind_accepts_narrower() {
    let clock = ManualClock::default();
    conformance::broader_kind_accepts_narrower(&sql(&clock)).await;
}

#[tokio::test]
async fn expired_tickets_are_hidden() {
    let clock = ManualClock::default();
    conformance::expired_tickets_are_hidden(&sql(&clock), &clock).await;
}

#[tokio::test]
async fn marked_expired_ticket_is_hidden() {
    let clock = ManualClock::default();
    conformance::marked_expired_ticket_is_hidden(&sql(&clock)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mutate_has_single_winner() {
    let clock = ManualClock::default();
    conformance::mutate_has_single_winner(Arc::new(sql(&clock))).await;
}

#[tokio::test]
async fn failed_mutation_writes_nothing() {
    let clock = ManualClock::default();
    conformance::failed_mutation_writes_nothing(&sql(&clock)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_child_appends_are_kept() {
    let clock = ManualClock::default();
    conformance::concurrent_child_appends_are_kept(Arc::new(sql(&clock))).await;
}

#[tokio::test]
async fn delete_cascades_to_descendants() {
    let clock = ManualClock::default();
    conformance::delete_cascades_to_descendants(&sql(&clock)).await;
}

#[tokio::test]
async fn scan_pages_cover_every_ticket() {
    let clock = ManualClock::default();
    conformance::scan_pages_cover_every_ticket(&sql(&clock)).await;
}

#[tokio::test]
async fn counts_follow_principal_and_service() {
    let clock = ManualClock::default();
    conformance::counts_follow_principal_and_service(&sql(&clock), &clock).await;
}

#[tokio::test]
async fn counts_agree_with_lookup_at_the_deadline() {
    let clock = ManualClock::default();
    conformance::counts_agree_with_lookup_at_the_deadline(&sql(&clock), &clock).await;
}

#[tokio::test]
async fn session_lifecycle_over_sql() {
    let clock = ManualClock::default();
    let registry: Arc<dyn TicketRegistry> = Arc::new(sql(&clock));
    let engine = TicketService::builder()
        .registry(Arc::clone(&registry))
        .services(Arc::new(test_services()))
        .build();

    let tgt = engine
        .create_ticket_granting_ticket(sample_authentication("casuser"))
        .await
        .expect("create");
    let st = engine.grant_service_ticket(&tgt.meta.id, TEST_SERVICE, None).await.expect("grant");
    assert_eq!(registry.count_sessions_for("casuser").await.expect("count"), 1);
    assert_eq!(registry.count_tickets_for(TEST_SERVICE).await.expect("count"), 1);

    let assertion =
        engine.validate_service_ticket(&st.meta.id, TEST_SERVICE).await.expect("validate");
    assert_eq!(assertion.principal().id, "casuser");
    assert_eq!(registry.count_tickets_for(TEST_SERVICE).await.expect("count"), 0);

    let replay = engine.validate_service_ticket(&st.meta.id, TEST_SERVICE).await;
    assert!(matches!(replay, Err(TicketError::InvalidTicket { .. })));

    assert_eq!(engine.destroy_ticket_granting_ticket(&tgt.meta.id).await.expect("destroy"), 1);
    let regrant = engine.grant_service_ticket(&tgt.meta.id, TEST_SERVICE, None).await;
    assert_eq!(regrant.err().and_then(|e| e.invalid_reason()), Some(InvalidReason::NotFound));
    assert_eq!(registry.count_sessions_for("casuser").await.expect("count"), 0);
}

#[tokio::test]
async fn file_database_survives_reopen() {
    let dir = std::env::temp_dir().join(format!("ticketd-sql-{}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    let path = dir.join("tickets.db");
    let _ = std::fs::remove_file(&path);

    let id = {
        let registry = SqlTicketRegistry::open(&path).expect("open");
        let engine = TicketService::builder()
            .registry(Arc::new(registry))
            .services(Arc::new(test_services()))
            .build();
        engine
            .create_ticket_granting_ticket(sample_authentication("casuser"))
            .await
            .expect("create")
            .meta
            .id
    };

    let reopened = SqlTicketRegistry::open(&path).expect("reopen");
    let found = reopened.get_ticket(&id).await.expect("get");
    assert_eq!(found.and_then(|t| t.principal_id().map(str::to_owned)).as_deref(), Some("casuser"));

    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test]
async fn cleaners_share_the_lock_row() {
    let clock = ManualClock::default();
    let registry = sql(&clock);
    registry
        .add_ticket(&service_ticket("ST-1-a", TEST_SERVICE, "TGT-1-a"))
        .await
        .expect("add");
    clock.advance(std::time::Duration::from_secs(30));

    let node_a = registry.locking_strategy("node-a");
    let node_b = TicketRegistryCleaner::builder()
        .registry(Arc::new(registry.clone()))
        .locking(Arc::new(registry.locking_strategy("node-b")))
        .build();

    assert!(node_a.acquire().await.expect("acquire"));
    let skipped = node_b.clean().await;
    assert!(skipped.skipped);
    assert_eq!(registry.count_tickets_for(TEST_SERVICE).await.expect("count"), 0);
    assert!(registry.find_ticket("ST-1-a").await.expect("find").is_some(), "nothing was swept");

    node_a.release().await.expect("release");
    let swept = node_b.clean().await;
    assert!(!swept.skipped);
    assert_eq!(swept.removed, 1);
    assert!(registry.find_ticket("ST-1-a").await.expect("find").is_none());
}
