//! Time source for expiration decisions.
//!
//! Registries and the engine read "now" through a [`Clock`] so that idle and
//! hard timeouts can be driven deterministically in tests.

use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};

/// A source of the current wall-clock time.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Shared handle to a clock.
pub type SharedClock = Arc<dyn Clock>;

/// The system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Returns a shared [`SystemClock`].
#[must_use]
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}
