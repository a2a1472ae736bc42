//! Ticket subsystem of a single-sign-on server.
//!
//! A login produces a ticket-granting ticket (TGT). The TGT is exchanged,
//! without re-authenticating, for single-use service tickets (ST) scoped to
//! one application each. Validating an ST may hand the application a
//! proxy-granting ticket (PGT), which in turn mints proxy tickets (PT) for
//! back-end calls made on the user's behalf.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  TicketService: create / grant / validate / destroy         │
//! │  TicketRegistryCleaner: periodic expiry sweep               │
//! ├─────────────────────────────────────────────────────────────┤
//! │  revocation::revoke: bounded breadth-first cascade          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  TicketRegistry (trait)                                     │
//! │   ├─ MemoryTicketRegistry                                   │
//! │   ├─ CacheTicketRegistry<B: StorageBackend>                 │
//! │   ├─ DocumentTicketRegistry<B: StorageBackend>              │
//! │   └─ SqlTicketRegistry (ticketd-ticket-sql)                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Ticket · ExpirationPolicy · TicketCatalog · TicketCodec    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//!
//! use ticketd_ticket::{
//!     Authentication, InMemoryServiceResolver, MemoryTicketRegistry, Principal, RegisteredService,
//!     TicketError, TicketService,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), TicketError> {
//!     let services = InMemoryServiceResolver::new()
//!         .with(RegisteredService::builder().id("https://app.example.org").build());
//!     let engine = TicketService::builder()
//!         .registry(Arc::new(MemoryTicketRegistry::new()))
//!         .services(Arc::new(services))
//!         .build();
//!
//!     let login = Authentication::builder().principal(Principal::new("casuser")).build();
//!     let tgt = engine.create_ticket_granting_ticket(login).await?;
//!     let st = engine.grant_service_ticket(&tgt.meta.id, "https://app.example.org", None).await?;
//!
//!     let assertion = engine.validate_service_ticket(&st.meta.id, "https://app.example.org").await?;
//!     assert_eq!(assertion.principal().id, "casuser");
//!
//!     let replay = engine.validate_service_ticket(&st.meta.id, "https://app.example.org").await;
//!     assert!(matches!(replay, Err(TicketError::InvalidTicket { .. })));
//!     Ok(())
//! }
//! ```
//!
//! # Feature Flags
//!
//! - **`testutil`**: the registry [`conformance`] suite, [`testutil::ManualClock`]
//!   and ticket fixtures.
//! - **`failpoints`**: activates `fail` injection points
//!   (`revocation-delete-descendant`, `ticket-cleaner-remove`, and the
//!   storage backend's own points).

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod authentication;
pub mod catalog;
pub mod cleanup;
pub mod clock;
pub mod codec;
pub mod config;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used, clippy::panic)]
pub mod conformance;
pub mod engine;
pub mod error;
pub mod expiration;
pub mod id;
pub mod locking;
pub mod registry;
pub mod revocation;
pub mod service;
#[cfg(any(test, feature = "testutil"))]
pub mod testutil;
pub mod ticket;

pub use authentication::{Attributes, Authentication, Principal};
pub use catalog::{TicketCatalog, TicketDefinition};
pub use cleanup::{CleanerHandle, CleanupReport, TicketRegistryCleaner};
pub use clock::{Clock, SharedClock, SystemClock};
pub use codec::{Aes256GcmTicketCipher, NoopTicketCipher, TicketCipher, TicketCodec, TicketRecord};
pub use config::{
    CleanerConfig, GrantingPolicyConfig, IdConfig, RegistryConfig, RevocationConfig,
    ServicePolicyConfig, TicketConfig,
};
pub use engine::{Assertion, TicketService};
pub use error::{ConfigError, InvalidReason, TicketError, TicketResult};
pub use expiration::ExpirationPolicy;
pub use id::{DefaultTicketIdGenerator, UniqueTicketIdGenerator};
pub use locking::{LockingStrategy, NoOpLockingStrategy, StorageLockingStrategy};
pub use registry::{
    CacheTicketRegistry, DocumentTicketRegistry, MemoryTicketRegistry, TicketMutation, TicketPage,
    TicketPredicate, TicketRegistry,
};
pub use revocation::{RevocationLimits, RevocationReport};
pub use service::{InMemoryServiceResolver, RegisteredService, ServiceResolver};
pub use ticket::{
    Consumable, Expirable, GrantingTicket, ProxyOrigin, ServiceTicket, Ticket, TicketKind,
    TicketMeta,
};
