//! Runs the registry conformance suite against every in-tree adapter.

#![allow(clippy::expect_used, clippy::panic)]

use std::sync::Arc;

use ticketd_storage::MemoryBackend;
use ticketd_ticket::{
    Aes256GcmTicketCipher, CacheTicketRegistry, DocumentTicketRegistry, MemoryTicketRegistry,
    TicketCodec, conformance, testutil::ManualClock,
};
use zeroize::Zeroizing;

fn memory(clock: &ManualClock) -> MemoryTicketRegistry {
    MemoryTicketRegistry::builder().clock(clock.shared()).build()
}

fn cache(clock: &ManualClock) -> CacheTicketRegistry<MemoryBackend> {
    CacheTicketRegistry::builder()
        .backend(MemoryBackend::new())
        .clock(clock.shared())
        .build()
        .expect("cache registry")
}

fn encrypted_cache(clock: &ManualClock) -> CacheTicketRegistry<MemoryBackend> {
    let cipher = Aes256GcmTicketCipher::new(&Zeroizing::new([42u8; 32]));
    CacheTicketRegistry::builder()
        .backend(MemoryBackend::new())
        .clock(clock.shared())
        .codec(TicketCodec::new(true, Arc::new(cipher)))
        .build()
        .expect("encrypted cache registry")
}

fn document(clock: &ManualClock) -> DocumentTicketRegistry<MemoryBackend> {
    DocumentTicketRegistry::builder()
        .backend(MemoryBackend::new())
        .clock(clock.shared())
        .build()
        .expect("document registry")
}

macro_rules! registry_conformance {
    ($module:ident, $make:ident) => {
        mod $module {
            use super::*;

            #[tokio::test]
            async fn round_trip_preserves_every_field() {
                let clock = ManualClock::default();
                conformance::round_trip_preserves_every_field(&$make(&clock)).await;
            }

            #[tokio::test]
            async fn duplicate_add_is_rejected() {
                let clock = ManualClock::default();
                conformance::duplicate_add_is_rejected(&$make(&clock)).await;
            }

            #[tokio::test]
            async fn update_is_upsert() {
                let clock = ManualClock::default();
                conformance::update_is_upsert(&$make(&clock)).await;
            }

            #[tokio::test]
            async fn delete_is_idempotent() {
                let clock = ManualClock::default();
                conformance::delete_is_idempotent(&$make(&clock)).await;
            }

            #[tokio::test]
            async fn delete_all_empties_the_registry() {
                let clock = ManualClock::default();
                conformance::delete_all_empties_the_registry(&$make(&clock)).await;
            }

            #[tokio::test]
            async fn typed_lookup_distinguishes_mismatch_from_missing() {
                let clock = ManualClock::default();
                conformance::typed_lookup_distinguishes_mismatch_from_missing(&$make(&clock)).await;
            }

            #[tokio::test]
            async fn broader_kind_accepts_narrower() {
                let clock = ManualClock::default();
                conformance::broader_kind_accepts_narrower(&$make(&clock)).await;
            }

            #[tokio::test]
            async fn expired_tickets_are_hidden() {
                let clock = ManualClock::default();
                conformance::expired_tickets_are_hidden(&$make(&clock), &clock).await;
            }

            #[tokio::test]
            async fn marked_expired_ticket_is_hidden() {
                let clock = ManualClock::default();
                conformance::marked_expired_ticket_is_hidden(&$make(&clock)).await;
            }

            #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
            async fn mutate_has_single_winner() {
                let clock = ManualClock::default();
                conformance::mutate_has_single_winner(Arc::new($make(&clock))).await;
            }

            #[tokio::test]
            async fn failed_mutation_writes_nothing() {
                let clock = ManualClock::default();
                conformance::failed_mutation_writes_nothing(&$make(&clock)).await;
            }

            #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
            async fn concurrent_child_appends_are_kept() {
                let clock = ManualClock::default();
                conformance::concurrent_child_appends_are_kept(Arc::new($make(&clock))).await;
            }

            #[tokio::test]
            async fn delete_cascades_to_descendants() {
                let clock = ManualClock::default();
                conformance::delete_cascades_to_descendants(&$make(&clock)).await;
            }

            #[tokio::test]
            async fn scan_pages_cover_every_ticket() {
                let clock = ManualClock::default();
                conformance::scan_pages_cover_every_ticket(&$make(&clock)).await;
            }

            #[tokio::test]
            async fn counts_follow_principal_and_service() {
                let clock = ManualClock::default();
                conformance::counts_follow_principal_and_service(&$make(&clock), &clock).await;
            }

            #[tokio::test]
            async fn counts_agree_with_lookup_at_the_deadline() {
                let clock = ManualClock::default();
                conformance::counts_agree_with_lookup_at_the_deadline(&$make(&clock), &clock).await;
            }
        }
    };
}

registry_conformance!(memory_registry, memory);
registry_conformance!(cache_registry, cache);
registry_conformance!(encrypted_cache_registry, encrypted_cache);
registry_conformance!(document_registry, document);
