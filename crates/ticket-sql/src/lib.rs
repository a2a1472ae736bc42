//! SQLite-backed ticket registry.
//!
//! [`SqlTicketRegistry`] stores one row per ticket. The sealed payload sits
//! beside the secondary attributes that sessions and services are counted
//! by:
//!
//! | Column | Contents |
//! |--------|----------|
//! | `id_digest` | digest of the ticket id (primary key) |
//! | `kind` | `ticket_granting`, `service`, `proxy_granting` or `proxy` |
//! | `payload` | sealed JSON ticket |
//! | `principal_digest` | digest of the session principal, granting tickets only |
//! | `service` | target service, service and proxy tickets only |
//! | `parent_digest` | digest of the granting ticket above |
//! | `expires_at` | last live instant, Unix milliseconds |
//!
//! A second table, `locks`, holds lease rows. Cleaners on every node that
//! share the database take the same row through
//! [`SqlTicketRegistry::locking_strategy`], so only one of them sweeps at a
//! time.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use ticketd_ticket::{InMemoryServiceResolver, TicketService};
//! use ticketd_ticket_sql::SqlTicketRegistry;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = SqlTicketRegistry::open("/var/lib/ticketd/tickets.db")?;
//! let engine = TicketService::builder()
//!     .registry(Arc::new(registry))
//!     .services(Arc::new(InMemoryServiceResolver::new()))
//!     .build();
//! # let _ = engine;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
mod locking;
mod registry;

pub use error::SqlRegistryError;
pub use locking::{CLEANER_LOCK_NAME, SqlLockingStrategy};
pub use registry::{DEFAULT_BUSY_TIMEOUT, SqlTicketRegistry};
