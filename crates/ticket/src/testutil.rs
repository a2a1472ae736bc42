//! Shared test utilities for ticket registries and the engine.
//!
//! Feature-gated behind `testutil`. Enable it from dependent crates:
//!
//! ```toml
//! [dev-dependencies]
//! ticketd-ticket = { workspace = true, features = ["testutil"] }
//! ```
//!
//! Fixture tickets are created at [`test_epoch`] with the default policies,
//! so registries under test should run on a [`ManualClock`] starting there.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;

use crate::{
    authentication::{Authentication, Principal},
    clock::{Clock, SharedClock},
    config::TicketConfig,
    service::{InMemoryServiceResolver, RegisteredService},
    ticket::{GrantingTicket, ProxyOrigin, ServiceTicket, Ticket, TicketKind, TicketMeta},
};

/// Service that accepts SSO and may not proxy.
pub const TEST_SERVICE: &str = "https://app.example.org";
/// Service that may obtain proxy-granting tickets.
pub const PROXY_SERVICE: &str = "https://portal.example.org";
/// Service that refuses SSO reuse.
pub const NO_SSO_SERVICE: &str = "https://bank.example.org";
/// Back-end service reached through a proxy ticket.
pub const BACKEND_SERVICE: &str = "https://backend.example.org";

/// 2024-01-01T00:00:00Z.
#[must_use]
pub fn test_epoch() -> DateTime<Utc> {
    DateTime::from_timestamp(1_704_067_200, 0).unwrap_or_default()
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// Creates a clock reading `start`.
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Arc::new(Mutex::new(start)) }
    }

    /// The current reading.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }

    /// Moves the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        let delta = TimeDelta::from_std(by).unwrap_or(TimeDelta::MAX);
        let mut now = self.now.lock();
        *now = now.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC);
    }

    /// Sets the clock to `at`.
    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock() = at;
    }

    /// A shared handle for registries; it keeps following this clock.
    #[must_use]
    pub fn shared(&self) -> SharedClock {
        Arc::new(self.clone())
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(test_epoch())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        ManualClock::now(self)
    }
}

/// An authentication of `principal` by the password handler.
#[must_use]
pub fn sample_authentication(principal: &str) -> Authentication {
    Authentication::builder()
        .principal(Principal::new(principal))
        .handlers(vec!["password".to_owned()])
        .authenticated_at(test_epoch())
        .build()
}

/// A resolver knowing [`TEST_SERVICE`], [`PROXY_SERVICE`],
/// [`NO_SSO_SERVICE`] and [`BACKEND_SERVICE`].
#[must_use]
pub fn test_services() -> InMemoryServiceResolver {
    InMemoryServiceResolver::new()
        .with(RegisteredService::builder().id(TEST_SERVICE).build())
        .with(RegisteredService::builder().id(PROXY_SERVICE).proxy_allowed(true).build())
        .with(RegisteredService::builder().id(NO_SSO_SERVICE).sso_enabled(false).build())
        .with(RegisteredService::builder().id(BACKEND_SERVICE).build())
}

fn meta(id: &str, kind: TicketKind) -> TicketMeta {
    TicketMeta::new(id, test_epoch(), TicketConfig::default().policy_for(kind))
}

/// A root TGT of `principal` with the default policy.
#[must_use]
pub fn granting_ticket(id: &str, principal: &str) -> Ticket {
    Ticket::TicketGranting(GrantingTicket::root(
        meta(id, TicketKind::TicketGranting),
        sample_authentication(principal),
    ))
}

/// A PGT of `principal` minted by validating `service_ticket_id`.
#[must_use]
pub fn proxy_granting_ticket(
    id: &str,
    principal: &str,
    service_ticket_id: &str,
    parent_id: &str,
) -> Ticket {
    let root = sample_authentication(principal);
    Ticket::ProxyGranting(GrantingTicket::proxy(
        meta(id, TicketKind::ProxyGranting),
        sample_authentication(PROXY_SERVICE),
        std::slice::from_ref(&root),
        ProxyOrigin {
            service_ticket_id: service_ticket_id.to_owned(),
            granting_ticket_id: parent_id.to_owned(),
        },
    ))
}

/// An unused ST for `service` granted by `parent_id`.
#[must_use]
pub fn service_ticket(id: &str, service: &str, parent_id: &str) -> Ticket {
    Ticket::Service(ServiceTicket::new(meta(id, TicketKind::Service), service, parent_id, true))
}

/// An unused PT for `service` granted by `parent_id`.
#[must_use]
pub fn proxy_ticket(id: &str, service: &str, parent_id: &str) -> Ticket {
    Ticket::Proxy(ServiceTicket::new(meta(id, TicketKind::Proxy), service, parent_id, false))
}

/// Assert that a [`TicketResult`](crate::TicketResult) is an
/// [`InvalidTicket`](crate::TicketError::InvalidTicket) error with the given
/// [`InvalidReason`](crate::InvalidReason).
#[macro_export]
macro_rules! assert_invalid_ticket {
    ($result:expr, $reason:ident) => {
        match $result {
            Err($crate::TicketError::InvalidTicket { reason, .. }) => assert_eq!(
                reason,
                $crate::InvalidReason::$reason,
                "expected InvalidTicket({}), got InvalidTicket({reason})",
                stringify!($reason),
            ),
            other => panic!(
                "expected InvalidTicket({}), got: {other:?}",
                stringify!($reason)
            ),
        }
    };
}
