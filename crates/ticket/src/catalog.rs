//! Ticket catalog.
//!
//! Static metadata for each ticket kind: the id prefix that identifies it, the
//! storage partition backends file it under, and the expiration policy new
//! tickets of that kind receive. Built once at startup and shared read-only.

use crate::{
    config::TicketConfig,
    error::ConfigError,
    expiration::ExpirationPolicy,
    id::prefix_of,
    ticket::TicketKind,
};

/// Prefix of ticket-granting ticket ids.
pub const TICKET_GRANTING_TICKET_PREFIX: &str = "TGT";
/// Prefix of service ticket ids.
pub const SERVICE_TICKET_PREFIX: &str = "ST";
/// Prefix of proxy-granting ticket ids.
pub const PROXY_GRANTING_TICKET_PREFIX: &str = "PGT";
/// Prefix of proxy ticket ids.
pub const PROXY_TICKET_PREFIX: &str = "PT";

/// Catalog entry for one ticket kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketDefinition {
    /// The kind described.
    pub kind: TicketKind,
    /// Id prefix, without the trailing `-`.
    pub prefix: String,
    /// Partition name used by backends that separate kinds.
    pub storage_name: String,
    /// Policy attached to newly issued tickets of this kind.
    pub expiration_policy: ExpirationPolicy,
}

/// Lookup table of [`TicketDefinition`]s, one per [`TicketKind`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketCatalog {
    definitions: [TicketDefinition; 4],
}

impl TicketCatalog {
    /// Builds the catalog with the standard prefixes and the policies from `config`.
    #[must_use]
    pub fn from_config(config: &TicketConfig) -> Self {
        let entry = |kind, prefix: &str, storage_name: &str| TicketDefinition {
            kind,
            prefix: prefix.to_owned(),
            storage_name: storage_name.to_owned(),
            expiration_policy: config.policy_for(kind),
        };
        Self {
            definitions: [
                entry(
                    TicketKind::TicketGranting,
                    TICKET_GRANTING_TICKET_PREFIX,
                    "ticket-granting-tickets",
                ),
                entry(TicketKind::Service, SERVICE_TICKET_PREFIX, "service-tickets"),
                entry(
                    TicketKind::ProxyGranting,
                    PROXY_GRANTING_TICKET_PREFIX,
                    "proxy-granting-tickets",
                ),
                entry(TicketKind::Proxy, PROXY_TICKET_PREFIX, "proxy-tickets"),
            ],
        }
    }

    /// Builds a catalog from explicit definitions, one per kind in any order.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if a kind is missing or repeated, or if
    /// prefixes or storage names are empty, contain `-`, or collide.
    pub fn new(definitions: Vec<TicketDefinition>) -> Result<Self, ConfigError> {
        let mut slots: [Option<TicketDefinition>; 4] = [None, None, None, None];
        for definition in definitions {
            if definition.prefix.is_empty() || definition.prefix.contains('-') {
                return Err(ConfigError::Invalid {
                    field: "catalog.prefix",
                    reason: format!("{:?} must be non-empty and must not contain '-'", definition.prefix),
                });
            }
            if definition.storage_name.is_empty() {
                return Err(ConfigError::Invalid {
                    field: "catalog.storage_name",
                    reason: format!("empty storage name for {}", definition.kind),
                });
            }
            let slot = &mut slots[definition.kind.index()];
            if slot.is_some() {
                return Err(ConfigError::Invalid {
                    field: "catalog",
                    reason: format!("{} defined twice", definition.kind),
                });
            }
            *slot = Some(definition);
        }

        let [Some(tgt), Some(st), Some(pgt), Some(pt)] = slots else {
            return Err(ConfigError::Invalid {
                field: "catalog",
                reason: "every ticket kind needs a definition".into(),
            });
        };
        let definitions = [tgt, st, pgt, pt];

        for (i, a) in definitions.iter().enumerate() {
            for b in &definitions[i + 1..] {
                if a.prefix == b.prefix || a.storage_name == b.storage_name {
                    return Err(ConfigError::Invalid {
                        field: "catalog",
                        reason: format!("{} and {} share a prefix or storage name", a.kind, b.kind),
                    });
                }
            }
        }
        Ok(Self { definitions })
    }

    /// The definition for `kind`.
    #[must_use]
    pub fn definition(&self, kind: TicketKind) -> &TicketDefinition {
        &self.definitions[kind.index()]
    }

    /// The definition whose prefix matches `prefix` exactly.
    #[must_use]
    pub fn find_by_prefix(&self, prefix: &str) -> Option<&TicketDefinition> {
        self.definitions.iter().find(|d| d.prefix == prefix)
    }

    /// The definition owning the ticket id `id`.
    #[must_use]
    pub fn find_by_id(&self, id: &str) -> Option<&TicketDefinition> {
        self.find_by_prefix(prefix_of(id))
    }

    /// All definitions in kind order.
    pub fn definitions(&self) -> impl Iterator<Item = &TicketDefinition> {
        self.definitions.iter()
    }
}

impl Default for TicketCatalog {
    fn default() -> Self {
        Self::from_config(&TicketConfig::default())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_id_uses_prefix_before_first_dash() {
        let catalog = TicketCatalog::default();
        assert_eq!(catalog.find_by_id("TGT-1-abc").map(|d| d.kind), Some(TicketKind::TicketGranting));
        assert_eq!(catalog.find_by_id("PGT-9-xyz-node").map(|d| d.kind), Some(TicketKind::ProxyGranting));
        assert_eq!(catalog.find_by_id("PT-2-q").map(|d| d.kind), Some(TicketKind::Proxy));
        assert!(catalog.find_by_id("OC-1-abc").is_none());
        assert!(catalog.find_by_id("").is_none());
    }

    #[test]
    fn default_policies_follow_config() {
        let catalog = TicketCatalog::default();
        assert!(matches!(
            catalog.definition(TicketKind::Service).expiration_policy,
            ExpirationPolicy::MultiUse { max_uses: 1, .. }
        ));
        assert!(matches!(
            catalog.definition(TicketKind::TicketGranting).expiration_policy,
            ExpirationPolicy::Timeout { .. }
        ));
    }

    #[test]
    fn rejects_colliding_prefixes() {
        let mut definitions: Vec<TicketDefinition> =
            TicketCatalog::default().definitions().cloned().collect();
        definitions[3].prefix = "ST".into();
        assert!(matches!(TicketCatalog::new(definitions), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn rejects_missing_kind() {
        let definitions: Vec<TicketDefinition> =
            TicketCatalog::default().definitions().take(3).cloned().collect();
        assert!(TicketCatalog::new(definitions).is_err());
    }

    #[test]
    fn accepts_custom_prefixes() {
        let mut definitions: Vec<TicketDefinition> =
            TicketCatalog::default().definitions().cloned().collect();
        definitions[0].prefix = "SSO".into();
        let catalog = TicketCatalog::new(definitions).unwrap();
        assert_eq!(catalog.definition(TicketKind::TicketGranting).prefix, "SSO");
    }
}
