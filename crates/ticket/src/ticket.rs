//! Ticket entity model.
//!
//! Tickets are a tagged enum rather than a class hierarchy. The four kinds
//! share two shapes:
//!
//! ```text
//!                 ┌────────────────────────┐
//!                 │ TicketGranting (TGT)   │  root session
//!                 └──────────┬─────────────┘
//!           services map     │      proxy_granting_tickets set
//!        ┌───────────────────┴──────────────────┐
//!        ▼                                      ▼
//! ┌──────────────┐   validated with proxy  ┌─────────────────────┐
//! │ Service (ST) │ ──────────────────────▶ │ ProxyGranting (PGT) │
//! └──────────────┘                         └──────────┬──────────┘
//!                                                     │ services map
//!                                                     ▼
//!                                              ┌────────────┐
//!                                              │ Proxy (PT) │
//!                                              └────────────┘
//! ```
//!
//! Granting tickets own the ids of the tickets they minted; children hold
//! only their parent's id. Relationships are resolved through the registry,
//! never through in-memory references.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{authentication::Authentication, expiration::ExpirationPolicy};

/// Discriminates the four ticket kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketKind {
    /// Root session credential.
    TicketGranting,
    /// Single-use credential for one service, minted from a TGT.
    Service,
    /// Session credential held by a proxying service, minted on validation.
    ProxyGranting,
    /// Single-use credential minted from a PGT.
    Proxy,
}

impl TicketKind {
    /// All kinds, in catalog order.
    pub const ALL: [TicketKind; 4] =
        [Self::TicketGranting, Self::Service, Self::ProxyGranting, Self::Proxy];

    /// Position of this kind in [`ALL`](Self::ALL).
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::TicketGranting => 0,
            Self::Service => 1,
            Self::ProxyGranting => 2,
            Self::Proxy => 3,
        }
    }

    /// Whether tickets of this kind can mint children.
    #[must_use]
    pub const fn is_granting(self) -> bool {
        matches!(self, Self::TicketGranting | Self::ProxyGranting)
    }

    /// Whether a request for `self` is satisfied by a stored ticket of `actual`.
    ///
    /// A PGT is a specialised TGT and a PT a specialised ST, so the broader
    /// kind accepts the narrower one but not the other way round.
    #[must_use]
    pub const fn accepts(self, actual: TicketKind) -> bool {
        matches!(
            (self, actual),
            (Self::TicketGranting, Self::TicketGranting | Self::ProxyGranting)
                | (Self::Service, Self::Service | Self::Proxy)
                | (Self::ProxyGranting, Self::ProxyGranting)
                | (Self::Proxy, Self::Proxy)
        )
    }

    /// Short lowercase name used in logs and storage records.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TicketGranting => "ticket_granting",
            Self::Service => "service",
            Self::ProxyGranting => "proxy_granting",
            Self::Proxy => "proxy",
        }
    }
}

impl fmt::Display for TicketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State shared by every ticket kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketMeta {
    /// Client-visible ticket id.
    pub id: String,
    /// Creation instant. Never changes.
    pub created_at: DateTime<Utc>,
    /// Last time the ticket was used or touched.
    pub last_used_at: DateTime<Utc>,
    /// The `last_used_at` value before the most recent use.
    pub previous_last_used_at: Option<DateTime<Utc>>,
    /// Number of recorded uses.
    pub count_of_uses: u32,
    /// Policy bound at creation.
    pub expiration_policy: ExpirationPolicy,
    /// Explicitly marked expired, independent of the policy.
    #[serde(default)]
    pub expired: bool,
}

impl TicketMeta {
    /// Creates metadata for a ticket minted at `now`.
    pub fn new(id: impl Into<String>, now: DateTime<Utc>, policy: ExpirationPolicy) -> Self {
        Self {
            id: id.into(),
            created_at: now,
            last_used_at: now,
            previous_last_used_at: None,
            count_of_uses: 0,
            expiration_policy: policy,
            expired: false,
        }
    }

    /// Records a use at `now`: shifts the last-used time and bumps the counter.
    pub fn record_use(&mut self, now: DateTime<Utc>) {
        self.touch(now);
        self.count_of_uses = self.count_of_uses.saturating_add(1);
    }

    /// Refreshes the last-used time without counting a use.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.previous_last_used_at = Some(self.last_used_at);
        self.last_used_at = now;
    }
}

/// Behaviour shared by everything that carries a [`TicketMeta`].
pub trait Expirable {
    /// Shared ticket state.
    fn meta(&self) -> &TicketMeta;

    /// Mutable shared ticket state.
    fn meta_mut(&mut self) -> &mut TicketMeta;

    /// The ticket id.
    fn id(&self) -> &str {
        &self.meta().id
    }

    /// Whether the ticket is expired at `now`, by flag or by policy.
    fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        let meta = self.meta();
        meta.expired || meta.expiration_policy.is_expired(meta, now)
    }

    /// Remaining lifetime for backend eviction; `None` means unbounded.
    fn time_to_live(&self, now: DateTime<Utc>) -> Option<Duration> {
        let meta = self.meta();
        if meta.expired {
            return Some(Duration::ZERO);
        }
        meta.expiration_policy.time_to_live(meta, now)
    }

    /// Marks the ticket expired regardless of its policy.
    fn mark_expired(&mut self) {
        self.meta_mut().expired = true;
    }
}

/// Behaviour of tickets that may be redeemed a bounded number of times.
pub trait Consumable: Expirable {
    /// Whether the ticket has been redeemed.
    fn is_consumed(&self) -> bool;

    /// Redeems the ticket at `now`. Returns `false` if it was already consumed.
    fn consume(&mut self, now: DateTime<Utc>) -> bool;
}

/// Identifies the validation that minted a proxy-granting ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyOrigin {
    /// The service ticket whose validation produced the PGT.
    pub service_ticket_id: String,
    /// The granting ticket that issued that service ticket.
    pub granting_ticket_id: String,
}

/// A session credential: a TGT, or a PGT when `parent` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantingTicket {
    /// Shared ticket state.
    pub meta: TicketMeta,
    /// The authentication this ticket was created from.
    pub authentication: Authentication,
    /// Every authentication in the proxy chain, root first, this ticket's last.
    pub chained_authentications: Vec<Authentication>,
    /// Where a PGT came from; `None` for a root TGT.
    pub parent: Option<ProxyOrigin>,
    /// Child service/proxy ticket id to the service it was issued for.
    #[serde(default)]
    pub services: BTreeMap<String, String>,
    /// PGTs minted from this ticket's service tickets.
    #[serde(default)]
    pub proxy_granting_tickets: BTreeSet<String>,
}

impl GrantingTicket {
    /// Creates a root ticket-granting ticket.
    #[must_use]
    pub fn root(meta: TicketMeta, authentication: Authentication) -> Self {
        Self {
            meta,
            chained_authentications: vec![authentication.clone()],
            authentication,
            parent: None,
            services: BTreeMap::new(),
            proxy_granting_tickets: BTreeSet::new(),
        }
    }

    /// Creates a proxy-granting ticket chained below `parent_chain`.
    #[must_use]
    pub fn proxy(
        meta: TicketMeta,
        authentication: Authentication,
        parent_chain: &[Authentication],
        origin: ProxyOrigin,
    ) -> Self {
        let mut chained_authentications = parent_chain.to_vec();
        chained_authentications.push(authentication.clone());
        Self {
            meta,
            authentication,
            chained_authentications,
            parent: Some(origin),
            services: BTreeMap::new(),
            proxy_granting_tickets: BTreeSet::new(),
        }
    }

    /// Whether this is a root session (no parent PGT chain).
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// The authentication at the root of the chain.
    #[must_use]
    pub fn root_authentication(&self) -> &Authentication {
        self.chained_authentications.first().unwrap_or(&self.authentication)
    }

    /// Records a ticket this one granted.
    pub fn record_service(&mut self, ticket_id: impl Into<String>, service: impl Into<String>) {
        self.services.insert(ticket_id.into(), service.into());
    }

    /// Ids of every ticket this one minted.
    pub fn descendant_ids(&self) -> impl Iterator<Item = &str> {
        self.services.keys().chain(self.proxy_granting_tickets.iter()).map(String::as_str)
    }
}

impl Expirable for GrantingTicket {
    fn meta(&self) -> &TicketMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut TicketMeta {
        &mut self.meta
    }
}

/// A single-service credential: an ST, or a PT when issued from a PGT.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceTicket {
    /// Shared ticket state.
    pub meta: TicketMeta,
    /// The service this ticket may be validated for.
    pub service: String,
    /// The granting ticket that minted it.
    pub granting_ticket_id: String,
    /// Issued on fresh credentials rather than SSO reuse.
    pub from_new_login: bool,
    /// Consumed by a validation.
    #[serde(default)]
    pub used: bool,
}

impl ServiceTicket {
    /// Creates an unused service ticket.
    #[must_use]
    pub fn new(
        meta: TicketMeta,
        service: impl Into<String>,
        granting_ticket_id: impl Into<String>,
        from_new_login: bool,
    ) -> Self {
        Self {
            meta,
            service: service.into(),
            granting_ticket_id: granting_ticket_id.into(),
            from_new_login,
            used: false,
        }
    }
}

impl Expirable for ServiceTicket {
    fn meta(&self) -> &TicketMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut TicketMeta {
        &mut self.meta
    }
}

impl Consumable for ServiceTicket {
    fn is_consumed(&self) -> bool {
        self.used
    }

    fn consume(&mut self, now: DateTime<Utc>) -> bool {
        if self.used {
            return false;
        }
        self.used = true;
        self.meta.record_use(now);
        true
    }
}

/// A stored ticket of any kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Ticket {
    /// Root session credential.
    TicketGranting(GrantingTicket),
    /// Service ticket.
    Service(ServiceTicket),
    /// Proxy-granting ticket.
    ProxyGranting(GrantingTicket),
    /// Proxy ticket.
    Proxy(ServiceTicket),
}

impl Ticket {
    /// The ticket's kind tag.
    #[must_use]
    pub fn kind(&self) -> TicketKind {
        match self {
            Self::TicketGranting(_) => TicketKind::TicketGranting,
            Self::Service(_) => TicketKind::Service,
            Self::ProxyGranting(_) => TicketKind::ProxyGranting,
            Self::Proxy(_) => TicketKind::Proxy,
        }
    }

    /// The granting view of a TGT or PGT.
    #[must_use]
    pub fn as_granting(&self) -> Option<&GrantingTicket> {
        match self {
            Self::TicketGranting(t) | Self::ProxyGranting(t) => Some(t),
            _ => None,
        }
    }

    /// Mutable granting view of a TGT or PGT.
    pub fn as_granting_mut(&mut self) -> Option<&mut GrantingTicket> {
        match self {
            Self::TicketGranting(t) | Self::ProxyGranting(t) => Some(t),
            _ => None,
        }
    }

    /// The service view of an ST or PT.
    #[must_use]
    pub fn as_service(&self) -> Option<&ServiceTicket> {
        match self {
            Self::Service(t) | Self::Proxy(t) => Some(t),
            _ => None,
        }
    }

    /// Mutable service view of an ST or PT.
    pub fn as_service_mut(&mut self) -> Option<&mut ServiceTicket> {
        match self {
            Self::Service(t) | Self::Proxy(t) => Some(t),
            _ => None,
        }
    }

    /// Principal id of the session this ticket belongs to, for granting tickets.
    #[must_use]
    pub fn principal_id(&self) -> Option<&str> {
        self.as_granting().map(|t| t.root_authentication().principal.id.as_str())
    }

    /// Target service of an ST or PT.
    #[must_use]
    pub fn service_id(&self) -> Option<&str> {
        self.as_service().map(|t| t.service.as_str())
    }

    /// Id of the granting ticket above this one, if any.
    #[must_use]
    pub fn parent_id(&self) -> Option<&str> {
        match self {
            Self::TicketGranting(_) => None,
            Self::ProxyGranting(t) => t.parent.as_ref().map(|p| p.granting_ticket_id.as_str()),
            Self::Service(t) | Self::Proxy(t) => Some(t.granting_ticket_id.as_str()),
        }
    }

    /// Ids of the tickets this one minted. Empty for service tickets.
    #[must_use]
    pub fn descendant_ids(&self) -> Vec<String> {
        self.as_granting()
            .map(|t| t.descendant_ids().map(str::to_owned).collect())
            .unwrap_or_default()
    }

    /// Whether this is a root TGT of `principal`.
    #[must_use]
    pub fn is_session_of(&self, principal: &str) -> bool {
        matches!(self, Self::TicketGranting(t) if t.is_root() && t.authentication.principal.id == principal)
    }
}

impl Expirable for Ticket {
    fn meta(&self) -> &TicketMeta {
        match self {
            Self::TicketGranting(t) | Self::ProxyGranting(t) => &t.meta,
            Self::Service(t) | Self::Proxy(t) => &t.meta,
        }
    }

    fn meta_mut(&mut self) -> &mut TicketMeta {
        match self {
            Self::TicketGranting(t) | Self::ProxyGranting(t) => &mut t.meta,
            Self::Service(t) | Self::Proxy(t) => &mut t.meta,
        }
    }
}
