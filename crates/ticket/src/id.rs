//! Ticket id generation.
//!
//! Ids have the shape `<PREFIX>-<sequence>-<random>[-<suffix>]`:
//!
//! - `PREFIX` names the catalog entry (`TGT`, `ST`, `PGT`, `PT`)
//! - `sequence` is a process-local counter, so ids from one node never repeat
//! - `random` is drawn from the thread-local CSPRNG, so ids are unguessable
//! - `suffix` optionally names the issuing node
//!
//! Clients treat the whole string as an opaque bearer token.

use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use rand::distr::{Alphanumeric, SampleString};

use crate::{config::IdConfig, error::ConfigError};

/// Produces unique ticket ids for a given prefix.
pub trait UniqueTicketIdGenerator: Send + Sync + fmt::Debug {
    /// Returns a new id starting with `prefix` followed by `-`.
    fn new_ticket_id(&self, prefix: &str) -> String;
}

/// Sequence-plus-random id generator.
///
/// # Example
///
/// ```
/// use ticketd_ticket::{DefaultTicketIdGenerator, UniqueTicketIdGenerator};
///
/// let generator = DefaultTicketIdGenerator::default();
/// let id = generator.new_ticket_id("ST");
/// assert!(id.starts_with("ST-1-"));
/// ```
#[derive(Debug)]
pub struct DefaultTicketIdGenerator {
    sequence: AtomicU64,
    random_length: usize,
    suffix: Option<String>,
}

impl DefaultTicketIdGenerator {
    /// Smallest accepted random part.
    pub const MIN_RANDOM_LENGTH: usize = 16;

    /// Creates a generator from id configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the random part is shorter than
    /// [`MIN_RANDOM_LENGTH`](Self::MIN_RANDOM_LENGTH) or the suffix is empty.
    pub fn new(config: &IdConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            sequence: AtomicU64::new(1),
            random_length: config.random_length,
            suffix: config.suffix.clone(),
        })
    }
}

impl Default for DefaultTicketIdGenerator {
    fn default() -> Self {
        let config = IdConfig::default();
        Self { sequence: AtomicU64::new(1), random_length: config.random_length, suffix: None }
    }
}

impl UniqueTicketIdGenerator for DefaultTicketIdGenerator {
    fn new_ticket_id(&self, prefix: &str) -> String {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let random = Alphanumeric.sample_string(&mut rand::rng(), self.random_length);
        match &self.suffix {
            Some(suffix) => format!("{prefix}-{sequence}-{random}-{suffix}"),
            None => format!("{prefix}-{sequence}-{random}"),
        }
    }
}

/// Returns the prefix of a ticket id: everything before the first `-`.
#[must_use]
pub fn prefix_of(id: &str) -> &str {
    id.split_once('-').map_or(id, |(prefix, _)| prefix)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::collections::HashSet;

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn shape_includes_sequence_random_and_suffix() {
        let generator = DefaultTicketIdGenerator::new(
            &IdConfig::builder().random_length(20).suffix("node-a".into()).build(),
        )
        .unwrap();

        let id = generator.new_ticket_id("TGT");
        let parts: Vec<&str> = id.splitn(4, '-').collect();
        assert_eq!(parts[0], "TGT");
        assert_eq!(parts[1], "1");
        assert_eq!(parts[2].len(), 20);
        assert!(parts[2].chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(parts[3], "node-a");
        assert_eq!(prefix_of(&id), "TGT");
    }

    #[test]
    fn rejects_short_random_part() {
        let err = DefaultTicketIdGenerator::new(&IdConfig::builder().random_length(4).build());
        assert!(matches!(err, Err(ConfigError::BelowMinimum { field: "id.random_length", .. })));
    }

    #[test]
    fn prefix_of_id_without_separator_is_whole_id() {
        assert_eq!(prefix_of("garbage"), "garbage");
    }

    proptest! {
        /// N sequential ids are pairwise distinct and keep their prefix.
        #[test]
        fn sequential_ids_are_unique(count in 1usize..500, prefix in "[A-Z]{1,4}") {
            let generator = DefaultTicketIdGenerator::default();
            let ids: HashSet<String> =
                (0..count).map(|_| generator.new_ticket_id(&prefix)).collect();
            prop_assert_eq!(ids.len(), count);
            prop_assert!(ids.iter().all(|id| prefix_of(id) == prefix));
        }
    }
}
