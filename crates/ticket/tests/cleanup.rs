//! Scheduling tests for `TicketRegistryCleaner`.
//!
//! Tokio time is paused, so the schedule advances only when every task is
//! idle. Ticket expiry follows the registry's `ManualClock`.

#![allow(clippy::expect_used, clippy::panic)]

use std::{sync::Arc, time::Duration};

use ticketd_ticket::{
    CleanerConfig, MemoryTicketRegistry, TicketRegistry, TicketRegistryCleaner,
    testutil::{ManualClock, TEST_SERVICE, granting_ticket, service_ticket},
};
use tokio::time::sleep;

const START_DELAY: Duration = Duration::from_secs(5);
const INTERVAL: Duration = Duration::from_secs(60);

fn schedule() -> CleanerConfig {
    CleanerConfig::builder().start_delay(START_DELAY).interval(INTERVAL).build()
}

/// A registry holding one live TGT and one service ticket that is already
/// past its lifetime.
async fn registry_with_expired_ticket() -> (ManualClock, MemoryTicketRegistry) {
    let clock = ManualClock::default();
    let registry = MemoryTicketRegistry::builder().clock(clock.shared()).build();
    registry.add_ticket(&granting_ticket("TGT-1-a", "casuser")).await.expect("add TGT");
    registry.add_ticket(&service_ticket("ST-1-a", TEST_SERVICE, "TGT-1-a")).await.expect("add ST");
    clock.advance(Duration::from_secs(30));
    (clock, registry)
}

#[tokio::test(start_paused = true)]
async fn scheduled_sweeps_wait_for_start_delay_and_repeat() {
    let (_clock, registry) = registry_with_expired_ticket().await;
    let cleaner = Arc::new(TicketRegistryCleaner::builder().registry(Arc::new(registry.clone())).build());
    let handle = cleaner.spawn(&schedule()).expect("cleaner is enabled");

    sleep(START_DELAY / 2).await;
    assert_eq!(registry.len(), 2, "no sweep before the start delay");

    sleep(START_DELAY).await;
    assert_eq!(registry.len(), 1, "first sweep removed the expired service ticket");

    registry.add_ticket(&service_ticket("ST-2-a", TEST_SERVICE, "TGT-1-a")).await.expect("add");
    assert_eq!(registry.len(), 2);

    sleep(INTERVAL).await;
    assert_eq!(registry.len(), 1, "next sweep removed the second one");

    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_during_start_delay_prevents_any_sweep() {
    let (_clock, registry) = registry_with_expired_ticket().await;
    let cleaner = Arc::new(TicketRegistryCleaner::builder().registry(Arc::new(registry.clone())).build());
    let handle = cleaner.spawn(&schedule()).expect("cleaner is enabled");

    handle.shutdown().await;
    sleep(START_DELAY + INTERVAL * 3).await;
    assert_eq!(registry.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn dropping_the_handle_stops_the_schedule() {
    let (_clock, registry) = registry_with_expired_ticket().await;
    let cleaner = Arc::new(TicketRegistryCleaner::builder().registry(Arc::new(registry.clone())).build());
    let handle = cleaner.spawn(&schedule()).expect("cleaner is enabled");

    sleep(START_DELAY * 2).await;
    assert_eq!(registry.len(), 1);

    drop(handle);
    registry.add_ticket(&service_ticket("ST-2-a", TEST_SERVICE, "TGT-1-a")).await.expect("add");
    sleep(INTERVAL * 3).await;
    assert_eq!(registry.len(), 2, "no sweep ran after the handle was dropped");
}

#[tokio::test(start_paused = true)]
async fn session_expiring_later_is_swept_on_a_later_tick() {
    let (clock, registry) = registry_with_expired_ticket().await;
    let cleaner = Arc::new(TicketRegistryCleaner::builder().registry(Arc::new(registry.clone())).build());
    let handle = cleaner.spawn(&schedule()).expect("cleaner is enabled");

    sleep(START_DELAY * 2).await;
    assert_eq!(registry.len(), 1);

    clock.advance(Duration::from_secs(3 * 60 * 60));
    sleep(INTERVAL).await;
    assert!(registry.is_empty());

    handle.shutdown().await;
}
