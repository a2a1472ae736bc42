//! Verifies that registry, engine and cleaner operations emit their spans.

#![allow(clippy::expect_used)]

use std::sync::{Arc, Mutex};

use ticketd_ticket::{
    MemoryTicketRegistry, TicketKind, TicketRegistry, TicketRegistryCleaner, TicketService,
    testutil::{TEST_SERVICE, sample_authentication, test_services},
};
use tracing::Subscriber;
use tracing_subscriber::{layer::SubscriberExt, registry::LookupSpan};

#[derive(Clone, Default)]
struct SpanCollector {
    spans: Arc<Mutex<Vec<String>>>,
}

impl<S> tracing_subscriber::Layer<S> for SpanCollector
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(
        &self,
        _attrs: &tracing::span::Attributes<'_>,
        id: &tracing::span::Id,
        ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        if let Some(span) = ctx.span(id) {
            self.spans.lock().expect("lock poisoned").push(span.name().to_owned());
        }
    }
}

fn assert_spans(spans: &Arc<Mutex<Vec<String>>>, expected: &[&str]) {
    let recorded = spans.lock().expect("lock poisoned");
    for name in expected {
        assert!(recorded.iter().any(|s| s == name), "expected a '{name}' span, got: {recorded:?}");
    }
}

#[tokio::test]
async fn ticket_lifecycle_creates_spans() {
    let collector = SpanCollector::default();
    let spans = Arc::clone(&collector.spans);

    let subscriber = tracing_subscriber::registry().with(collector);
    let _guard = tracing::subscriber::set_default(subscriber);

    let engine = TicketService::builder()
        .registry(Arc::new(MemoryTicketRegistry::new()))
        .services(Arc::new(test_services()))
        .build();
    let tgt = engine
        .create_ticket_granting_ticket(sample_authentication("casuser"))
        .await
        .expect("create");
    let st = engine.grant_service_ticket(&tgt.meta.id, TEST_SERVICE, None).await.expect("grant");
    engine.validate_service_ticket(&st.meta.id, TEST_SERVICE).await.expect("validate");
    engine.destroy_ticket_granting_ticket(&tgt.meta.id).await.expect("destroy");

    assert_spans(
        &spans,
        &[
            "create_ticket_granting_ticket",
            "grant_service_ticket",
            "validate_service_ticket",
            "destroy_ticket_granting_ticket",
            "add_ticket",
            "mutate_ticket",
            "find_ticket",
            "get_ticket",
            "delete_single_ticket",
            "revoke",
        ],
    );
}

#[tokio::test]
async fn cleanup_sweep_creates_spans() {
    let collector = SpanCollector::default();
    let spans = Arc::clone(&collector.spans);

    let subscriber = tracing_subscriber::registry().with(collector);
    let _guard = tracing::subscriber::set_default(subscriber);

    let registry = Arc::new(MemoryTicketRegistry::new());
    registry.count_sessions_for("casuser").await.expect("count");
    TicketRegistryCleaner::builder().registry(registry).build().clean().await;

    assert_spans(&spans, &["clean", "scan_tickets", "count_sessions_for", "get_tickets"]);
}

#[tokio::test]
async fn provided_registry_lookups_create_spans() {
    let collector = SpanCollector::default();
    let spans = Arc::clone(&collector.spans);

    let subscriber = tracing_subscriber::registry().with(collector);
    let _guard = tracing::subscriber::set_default(subscriber);

    let registry = MemoryTicketRegistry::new();
    registry.get_typed_ticket("TGT-1-missing", TicketKind::TicketGranting).await.expect("typed");
    registry.count_tickets_for(TEST_SERVICE).await.expect("count");
    registry.delete_ticket("TGT-1-missing").await.expect("delete");

    assert_spans(
        &spans,
        &["get_typed_ticket", "get_ticket", "count_tickets_for", "get_tickets", "delete_ticket"],
    );
}
