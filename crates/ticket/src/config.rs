//! Ticket subsystem configuration.
//!
//! [`TicketConfig`] deserializes from any serde format with human-readable
//! durations (`"8h"`, `"10s"`) and rejects unknown keys. Programmatic callers
//! use the builders, which validate on `build()`.
//!
//! ```
//! use std::time::Duration;
//!
//! use ticketd_ticket::TicketConfig;
//!
//! let config: TicketConfig = serde_json::from_str(r#"{
//!     "ticket_granting": { "idle_timeout": "30m", "hard_timeout": "8h" },
//!     "cleaner": { "interval": "1m" }
//! }"#).unwrap();
//! config.validate().unwrap();
//! assert_eq!(config.ticket_granting.idle_timeout, Duration::from_secs(1800));
//! assert_eq!(config.service.max_uses, 1);
//! ```
//!
//! Encryption keys are deliberately absent: they go straight to
//! [`Aes256GcmTicketCipher`](crate::Aes256GcmTicketCipher).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{error::ConfigError, expiration::ExpirationPolicy, ticket::TicketKind};

const DEFAULT_GRANTING_IDLE: Duration = Duration::from_secs(2 * 60 * 60);
const DEFAULT_GRANTING_HARD: Duration = Duration::from_secs(8 * 60 * 60);
const DEFAULT_SERVICE_TTL: Duration = Duration::from_secs(10);
const DEFAULT_SERVICE_MAX_USES: u32 = 1;
const DEFAULT_RANDOM_LENGTH: usize = 32;
const DEFAULT_MAX_DEPTH: usize = 16;
const DEFAULT_MAX_TICKETS: usize = 10_000;
const DEFAULT_CLEANER_INTERVAL: Duration = Duration::from_secs(120);
const DEFAULT_CLEANER_START_DELAY: Duration = Duration::from_secs(20);
/// Tickets fetched per cleaner scan page.
pub const DEFAULT_CLEANER_BATCH_SIZE: usize = 500;
/// Ten years: the longest eviction deadline handed to a backend.
pub const DEFAULT_MAX_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);
const DEFAULT_CAS_ATTEMPTS: u32 = 16;

fn below_minimum(field: &'static str, min: impl ToString, value: impl ToString) -> ConfigError {
    ConfigError::BelowMinimum { field, min: min.to_string(), value: value.to_string() }
}

fn require_positive(field: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(below_minimum(field, "1ns", "0s"));
    }
    Ok(())
}

/// Idle and hard timeouts for session-style tickets (TGT, PGT).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
#[serde(deny_unknown_fields)]
pub struct GrantingPolicyConfig {
    /// Maximum time between uses.
    #[serde(with = "humantime_serde", default = "default_granting_idle")]
    #[builder(default = DEFAULT_GRANTING_IDLE)]
    pub idle_timeout: Duration,
    /// Maximum lifetime.
    #[serde(with = "humantime_serde", default = "default_granting_hard")]
    #[builder(default = DEFAULT_GRANTING_HARD)]
    pub hard_timeout: Duration,
}

fn default_granting_idle() -> Duration {
    DEFAULT_GRANTING_IDLE
}

fn default_granting_hard() -> Duration {
    DEFAULT_GRANTING_HARD
}

impl Default for GrantingPolicyConfig {
    fn default() -> Self {
        Self { idle_timeout: DEFAULT_GRANTING_IDLE, hard_timeout: DEFAULT_GRANTING_HARD }
    }
}

impl GrantingPolicyConfig {
    fn validate(&self, idle_field: &'static str, hard_field: &'static str) -> Result<(), ConfigError> {
        require_positive(idle_field, self.idle_timeout)?;
        require_positive(hard_field, self.hard_timeout)
    }

    /// The policy attached to new tickets.
    #[must_use]
    pub fn policy(&self) -> ExpirationPolicy {
        ExpirationPolicy::Timeout { idle: self.idle_timeout, hard: self.hard_timeout }
    }
}

/// Lifetime and use count for service-style tickets (ST, PT).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
#[serde(deny_unknown_fields)]
pub struct ServicePolicyConfig {
    /// Lifetime from issue.
    #[serde(with = "humantime_serde", default = "default_service_ttl")]
    #[builder(default = DEFAULT_SERVICE_TTL)]
    pub time_to_live: Duration,
    /// Validations allowed before expiry.
    #[serde(default = "default_service_max_uses")]
    #[builder(default = DEFAULT_SERVICE_MAX_USES)]
    pub max_uses: u32,
}

fn default_service_ttl() -> Duration {
    DEFAULT_SERVICE_TTL
}

fn default_service_max_uses() -> u32 {
    DEFAULT_SERVICE_MAX_USES
}

impl Default for ServicePolicyConfig {
    fn default() -> Self {
        Self { time_to_live: DEFAULT_SERVICE_TTL, max_uses: DEFAULT_SERVICE_MAX_USES }
    }
}

impl ServicePolicyConfig {
    fn validate(&self, ttl_field: &'static str, uses_field: &'static str) -> Result<(), ConfigError> {
        require_positive(ttl_field, self.time_to_live)?;
        if self.max_uses == 0 {
            return Err(below_minimum(uses_field, 1, 0));
        }
        Ok(())
    }

    /// The policy attached to new tickets.
    #[must_use]
    pub fn policy(&self) -> ExpirationPolicy {
        ExpirationPolicy::MultiUse { max_uses: self.max_uses, time_to_live: self.time_to_live }
    }
}

/// Ticket id shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
#[serde(deny_unknown_fields)]
pub struct IdConfig {
    /// Length of the random alphanumeric part.
    #[serde(default = "default_random_length")]
    #[builder(default = DEFAULT_RANDOM_LENGTH)]
    pub random_length: usize,
    /// Optional node name appended to every id.
    #[serde(default)]
    pub suffix: Option<String>,
}

fn default_random_length() -> usize {
    DEFAULT_RANDOM_LENGTH
}

impl Default for IdConfig {
    fn default() -> Self {
        Self { random_length: DEFAULT_RANDOM_LENGTH, suffix: None }
    }
}

impl IdConfig {
    /// Checks the random length floor and the suffix.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for a random part shorter than 16 characters or
    /// an empty suffix.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let min = crate::id::DefaultTicketIdGenerator::MIN_RANDOM_LENGTH;
        if self.random_length < min {
            return Err(below_minimum("id.random_length", min, self.random_length));
        }
        if self.suffix.as_deref().is_some_and(str::is_empty) {
            return Err(ConfigError::Invalid { field: "id.suffix", reason: "must not be empty".into() });
        }
        Ok(())
    }
}

/// Bounds on cascading revocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
#[serde(deny_unknown_fields)]
pub struct RevocationConfig {
    /// Deepest descendant level visited below the revoked ticket.
    #[serde(default = "default_max_depth")]
    #[builder(default = DEFAULT_MAX_DEPTH)]
    pub max_depth: usize,
    /// Most descendants visited in one revocation.
    #[serde(default = "default_max_tickets")]
    #[builder(default = DEFAULT_MAX_TICKETS)]
    pub max_tickets: usize,
}

fn default_max_depth() -> usize {
    DEFAULT_MAX_DEPTH
}

fn default_max_tickets() -> usize {
    DEFAULT_MAX_TICKETS
}

impl Default for RevocationConfig {
    fn default() -> Self {
        Self { max_depth: DEFAULT_MAX_DEPTH, max_tickets: DEFAULT_MAX_TICKETS }
    }
}

/// Background cleanup schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
#[serde(deny_unknown_fields)]
pub struct CleanerConfig {
    /// Whether the sweep runs at all.
    #[serde(default = "default_true")]
    #[builder(default = true)]
    pub enabled: bool,
    /// Time between sweeps.
    #[serde(with = "humantime_serde", default = "default_cleaner_interval")]
    #[builder(default = DEFAULT_CLEANER_INTERVAL)]
    pub interval: Duration,
    /// Delay before the first sweep.
    #[serde(with = "humantime_serde", default = "default_cleaner_start_delay")]
    #[builder(default = DEFAULT_CLEANER_START_DELAY)]
    pub start_delay: Duration,
    /// Tickets fetched per scan page.
    #[serde(default = "default_cleaner_batch_size")]
    #[builder(default = DEFAULT_CLEANER_BATCH_SIZE)]
    pub batch_size: usize,
}

fn default_true() -> bool {
    true
}

fn default_cleaner_interval() -> Duration {
    DEFAULT_CLEANER_INTERVAL
}

fn default_cleaner_start_delay() -> Duration {
    DEFAULT_CLEANER_START_DELAY
}

fn default_cleaner_batch_size() -> usize {
    DEFAULT_CLEANER_BATCH_SIZE
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: DEFAULT_CLEANER_INTERVAL,
            start_delay: DEFAULT_CLEANER_START_DELAY,
            batch_size: DEFAULT_CLEANER_BATCH_SIZE,
        }
    }
}

/// Settings shared by the storage-backed registries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
    /// Store SHA-512 digests of ids instead of the ids themselves.
    #[serde(default = "default_true")]
    #[builder(default = true)]
    pub digest_ids: bool,
    /// Cap on eviction deadlines; also used for tickets with unbounded TTL.
    #[serde(with = "humantime_serde", default = "default_max_ttl")]
    #[builder(default = DEFAULT_MAX_TTL)]
    pub max_ttl: Duration,
    /// Compare-and-set attempts in one atomic read-modify-write.
    #[serde(default = "default_cas_attempts")]
    #[builder(default = DEFAULT_CAS_ATTEMPTS)]
    pub cas_attempts: u32,
}

fn default_max_ttl() -> Duration {
    DEFAULT_MAX_TTL
}

fn default_cas_attempts() -> u32 {
    DEFAULT_CAS_ATTEMPTS
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { digest_ids: true, max_ttl: DEFAULT_MAX_TTL, cas_attempts: DEFAULT_CAS_ATTEMPTS }
    }
}

impl RegistryConfig {
    /// Checks that the TTL cap and CAS budget are usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::BelowMinimum`] for a zero `max_ttl` or `cas_attempts`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("registry.max_ttl", self.max_ttl)?;
        if self.cas_attempts == 0 {
            return Err(below_minimum("registry.cas_attempts", 1, 0));
        }
        Ok(())
    }

    /// Backend eviction deadline for a ticket's reported TTL.
    #[must_use]
    pub fn capped_ttl(&self, ttl: Option<Duration>) -> Duration {
        ttl.map_or(self.max_ttl, |ttl| ttl.min(self.max_ttl))
    }
}

/// Complete ticket subsystem configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TicketConfig {
    /// TGT policy.
    pub ticket_granting: GrantingPolicyConfig,
    /// ST policy.
    pub service: ServicePolicyConfig,
    /// PGT policy.
    pub proxy_granting: GrantingPolicyConfig,
    /// PT policy.
    pub proxy: ServicePolicyConfig,
    /// Id generator settings.
    pub id: IdConfig,
    /// Revocation bounds.
    pub revocation: RevocationConfig,
    /// Cleanup schedule.
    pub cleaner: CleanerConfig,
    /// Storage-backed registry settings.
    pub registry: RegistryConfig,
}

#[bon::bon]
impl TicketConfig {
    /// Creates a validated configuration; omitted sections take their defaults.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found by [`validate`](Self::validate).
    #[builder]
    pub fn new(
        #[builder(default)] ticket_granting: GrantingPolicyConfig,
        #[builder(default)] service: ServicePolicyConfig,
        #[builder(default)] proxy_granting: GrantingPolicyConfig,
        #[builder(default)] proxy: ServicePolicyConfig,
        #[builder(default)] id: IdConfig,
        #[builder(default)] revocation: RevocationConfig,
        #[builder(default)] cleaner: CleanerConfig,
        #[builder(default)] registry: RegistryConfig,
    ) -> Result<Self, ConfigError> {
        let config =
            Self { ticket_granting, service, proxy_granting, proxy, id, revocation, cleaner, registry };
        config.validate()?;
        Ok(config)
    }

    /// Checks every section.
    ///
    /// Deserialized configurations are not validated automatically; call this
    /// before handing one to the subsystem.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.ticket_granting
            .validate("ticket_granting.idle_timeout", "ticket_granting.hard_timeout")?;
        self.service.validate("service.time_to_live", "service.max_uses")?;
        self.proxy_granting
            .validate("proxy_granting.idle_timeout", "proxy_granting.hard_timeout")?;
        self.proxy.validate("proxy.time_to_live", "proxy.max_uses")?;
        self.id.validate()?;
        if self.revocation.max_depth == 0 {
            return Err(below_minimum("revocation.max_depth", 1, 0));
        }
        if self.revocation.max_tickets == 0 {
            return Err(below_minimum("revocation.max_tickets", 1, 0));
        }
        if self.cleaner.enabled {
            require_positive("cleaner.interval", self.cleaner.interval)?;
        }
        if self.cleaner.batch_size == 0 {
            return Err(below_minimum("cleaner.batch_size", 1, 0));
        }
        self.registry.validate()
    }

    /// Default expiration policy for newly issued tickets of `kind`.
    #[must_use]
    pub fn policy_for(&self, kind: TicketKind) -> ExpirationPolicy {
        match kind {
            TicketKind::TicketGranting => self.ticket_granting.policy(),
            TicketKind::Service => self.service.policy(),
            TicketKind::ProxyGranting => self.proxy_granting.policy(),
            TicketKind::Proxy => self.proxy.policy(),
        }
    }
}
