//! Key/value storage abstraction underneath the distributed ticket registries.
//!
//! The ticket crate turns tickets into keys and values; this crate supplies the
//! byte-level contract ([`StorageBackend`]) those registries are generic over,
//! plus an in-memory implementation used in development and tests.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      TicketService                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │   CacheTicketRegistry<B>    │   DocumentTicketRegistry<B>   │
//! │  (one key per ticket, TTL)  │ (records + secondary indexes) │
//! ├─────────────────────────────────────────────────────────────┤
//! │                    ticketd-storage                          │
//! │   StorageBackend: get, set, set_with_ttl, compare_and_set,  │
//! │           delete, get_range, clear_range, transaction       │
//! ├─────────────────────────────────────────────────────────────┤
//! │                     MemoryBackend                           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```
//! use ticketd_storage::{MemoryBackend, StorageBackend};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = MemoryBackend::new();
//!
//!     backend.set(b"tickets/st/abc".to_vec(), b"payload".to_vec()).await?;
//!     let value = backend.get(b"tickets/st/abc").await?;
//!     assert_eq!(value.map(|b| b.to_vec()), Some(b"payload".to_vec()));
//!
//!     Ok(())
//! }
//! ```
//!
//! # Feature Flags
//!
//! - **`testutil`**: the [`conformance`] suite, key helpers and assertion macros.
//! - **`failpoints`**: activates `fail` injection points inside [`MemoryBackend`]
//!   (`memory-backend-get`, `memory-backend-set`, `memory-backend-cas`,
//!   `memory-backend-delete`, `memory-backend-get-range`,
//!   `memory-transaction-commit`).

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod conformance;
pub mod error;
pub mod memory;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod testutil;
pub mod transaction;
pub mod types;

pub use backend::StorageBackend;
pub use error::{BoxError, StorageError, StorageResult};
pub use memory::MemoryBackend;
pub use transaction::Transaction;
pub use types::KeyValue;
