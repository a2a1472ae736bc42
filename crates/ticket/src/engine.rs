//! Issuance and validation engine.
//!
//! [`TicketService`] is the only entry point protocol adapters call. It
//! drives each ticket through its lifecycle:
//!
//! ```text
//!  login ──▶ TGT ──grant──▶ ST ──validate──▶ Used ──▶ deleted
//!             │                  │
//!             │                  └─validate with proxy──▶ PGT ──grant──▶ PT
//!             │
//!             └──destroy / expiry──▶ revoked with every descendant
//! ```
//!
//! Every state change that concurrent requests can race on goes through
//! [`TicketRegistry::mutate_ticket`]: consuming a service ticket, and
//! recording a child on a granting ticket. Grant writes the parent first and
//! the child second, so an interrupted grant can only leave the parent
//! listing a child that does not exist, which revocation ignores.

use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::{
    authentication::{Authentication, Principal},
    error::{InvalidReason, TicketError, TicketResult},
    id::{DefaultTicketIdGenerator, UniqueTicketIdGenerator},
    registry::TicketRegistry,
    revocation::{self, RevocationLimits},
    service::{RegisteredService, ServiceResolver},
    ticket::{
        Consumable, Expirable, GrantingTicket, ProxyOrigin, ServiceTicket, Ticket, TicketKind,
        TicketMeta,
    },
};

/// The outcome of a successful service ticket validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assertion {
    /// The authentication at the root of the session.
    pub primary_authentication: Authentication,
    /// Every authentication in the proxy chain, root first.
    pub chained_authentications: Vec<Authentication>,
    /// The service the ticket was validated for.
    pub service: String,
    /// Whether the ticket was issued on fresh credentials.
    pub from_new_login: bool,
}

impl Assertion {
    /// The authenticated principal.
    #[must_use]
    pub fn principal(&self) -> &Principal {
        &self.primary_authentication.principal
    }

    /// Whether the ticket was obtained through a proxy chain.
    #[must_use]
    pub fn is_proxied(&self) -> bool {
        self.chained_authentications.len() > 1
    }
}

/// How a child ticket is minted from a granting ticket.
struct Issue<'a> {
    granting_id: &'a str,
    granting_kind: TicketKind,
    kind: TicketKind,
    service: &'a str,
    fresh: Option<&'a Authentication>,
    enforce_sso: bool,
}

/// Creates, grants, validates and destroys tickets.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
///
/// use ticketd_ticket::{
///     Authentication, InMemoryServiceResolver, MemoryTicketRegistry, Principal,
///     RegisteredService, TicketService,
/// };
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let services = InMemoryServiceResolver::new()
///     .with(RegisteredService::builder().id("https://app.example.org").build());
/// let engine = TicketService::builder()
///     .registry(Arc::new(MemoryTicketRegistry::new()))
///     .services(Arc::new(services))
///     .build();
///
/// let auth = Authentication::builder().principal(Principal::new("casuser")).build();
/// let tgt = engine.create_ticket_granting_ticket(auth).await.unwrap();
/// let st = engine.grant_service_ticket(&tgt.meta.id, "https://app.example.org", None).await.unwrap();
/// let assertion = engine.validate_service_ticket(&st.meta.id, "https://app.example.org").await.unwrap();
/// assert_eq!(assertion.principal().id, "casuser");
/// # });
/// ```
#[derive(bon::Builder)]
pub struct TicketService {
    registry: Arc<dyn TicketRegistry>,
    services: Arc<dyn ServiceResolver>,
    #[builder(default = Arc::new(DefaultTicketIdGenerator::default()))]
    id_generator: Arc<dyn UniqueTicketIdGenerator>,
    #[builder(default)]
    limits: RevocationLimits,
}

impl fmt::Debug for TicketService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TicketService")
            .field("registry", &self.registry)
            .field("id_generator", &self.id_generator)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl TicketService {
    /// The registry tickets are stored in.
    #[must_use]
    pub fn registry(&self) -> &Arc<dyn TicketRegistry> {
        &self.registry
    }

    fn now(&self) -> DateTime<Utc> {
        self.registry.clock().now()
    }

    fn new_meta(&self, kind: TicketKind) -> TicketMeta {
        let definition = self.registry.catalog().definition(kind);
        TicketMeta::new(
            self.id_generator.new_ticket_id(&definition.prefix),
            self.now(),
            definition.expiration_policy,
        )
    }

    async fn resolve(&self, service: &str) -> TicketResult<RegisteredService> {
        self.services.resolve(service).await?.ok_or_else(|| {
            debug!(service, "rejected unrecognized service");
            TicketError::UnrecognizedService { service: service.to_owned() }
        })
    }

    /// Starts a session for a successful login.
    ///
    /// Concurrent logins by one principal each get an independent TGT.
    ///
    /// # Errors
    ///
    /// Returns [`TicketError::DuplicateTicket`] on an id collision, or a
    /// storage error.
    #[tracing::instrument(skip(self, authentication), fields(principal = %authentication.principal.id))]
    pub async fn create_ticket_granting_ticket(
        &self,
        authentication: Authentication,
    ) -> TicketResult<GrantingTicket> {
        let tgt = GrantingTicket::root(self.new_meta(TicketKind::TicketGranting), authentication);
        self.registry.add_ticket(&Ticket::TicketGranting(tgt.clone())).await?;

        info!(ticket = %tgt.id(), principal = %tgt.authentication.principal.id, "created ticket-granting ticket");
        Ok(tgt)
    }

    /// Issues a service ticket for `service` from a live TGT.
    ///
    /// `fresh` carries credentials the user re-presented for this request; it
    /// must belong to the session's principal.
    ///
    /// # Errors
    ///
    /// - [`TicketError::UnrecognizedService`] if the resolver does not know `service`
    /// - [`TicketError::InvalidTicket`] if the TGT is missing, expired or not a TGT;
    ///   an expired TGT is revoked with its descendants
    /// - [`TicketError::PrincipalMismatch`] if `fresh` belongs to someone else
    /// - [`TicketError::UnauthorizedSsoService`] if the service refuses SSO reuse
    #[tracing::instrument(skip(self, fresh))]
    pub async fn grant_service_ticket(
        &self,
        tgt_id: &str,
        service: &str,
        fresh: Option<&Authentication>,
    ) -> TicketResult<ServiceTicket> {
        self.issue(Issue {
            granting_id: tgt_id,
            granting_kind: TicketKind::TicketGranting,
            kind: TicketKind::Service,
            service,
            fresh,
            enforce_sso: true,
        })
        .await
    }

    /// Issues a proxy ticket for `service` from a live PGT.
    ///
    /// # Errors
    ///
    /// As [`grant_service_ticket`](Self::grant_service_ticket), with the PGT in
    /// place of the TGT.
    #[tracing::instrument(skip(self))]
    pub async fn grant_proxy_ticket(&self, pgt_id: &str, service: &str) -> TicketResult<ServiceTicket> {
        self.issue(Issue {
            granting_id: pgt_id,
            granting_kind: TicketKind::ProxyGranting,
            kind: TicketKind::Proxy,
            service,
            fresh: None,
            enforce_sso: false,
        })
        .await
    }

    async fn issue(&self, request: Issue<'_>) -> TicketResult<ServiceTicket> {
        let Issue { granting_id, granting_kind, kind, service, fresh, enforce_sso } = request;
        let registered = self.resolve(service).await?;
        let meta = self.new_meta(kind);
        let child_id = meta.id.clone();
        let now = meta.created_at;

        let record_child = |ticket: &mut Ticket| -> TicketResult<()> {
            if ticket.kind() != granting_kind {
                return Err(TicketError::invalid(granting_id, InvalidReason::WrongType));
            }
            if ticket.is_expired_at(now) {
                return Err(TicketError::invalid(granting_id, InvalidReason::Expired));
            }
            let Some(granting) = ticket.as_granting_mut() else {
                return Err(TicketError::invalid(granting_id, InvalidReason::WrongType));
            };
            match fresh {
                Some(fresh) => {
                    if fresh.principal.id != granting.root_authentication().principal.id {
                        return Err(TicketError::PrincipalMismatch {
                            id: granting_id.to_owned(),
                            presented: fresh.principal.id.clone(),
                        });
                    }
                },
                None if enforce_sso
                    && !registered.sso_enabled
                    && granting.meta.count_of_uses > 0 =>
                {
                    return Err(TicketError::UnauthorizedSsoService {
                        service: service.to_owned(),
                    });
                },
                None => {},
            }
            granting.record_service(child_id.as_str(), service);
            granting.meta.record_use(now);
            Ok(())
        };

        let granting = match self.registry.mutate_ticket(granting_id, &record_child).await {
            Ok(Some(granting)) => granting,
            Ok(None) => {
                debug!(ticket = granting_id, "rejected grant from unknown ticket");
                return Err(TicketError::invalid(granting_id, InvalidReason::NotFound));
            },
            Err(error) => {
                debug!(ticket = granting_id, %error, "rejected grant");
                if error.invalid_reason() == Some(InvalidReason::Expired) {
                    self.revoke_expired(granting_id).await;
                }
                return Err(error);
            },
        };

        let from_new_login = kind == TicketKind::Service
            && (granting.meta().count_of_uses == 1 || fresh.is_some());
        let issued = ServiceTicket::new(meta, service, granting_id, from_new_login);
        let stored = match kind {
            TicketKind::Proxy => Ticket::Proxy(issued.clone()),
            _ => Ticket::Service(issued.clone()),
        };
        self.registry.add_ticket(&stored).await?;

        info!(
            ticket = %issued.id(),
            granting_ticket = granting_id,
            service,
            from_new_login,
            "granted {kind} ticket",
        );
        Ok(issued)
    }

    async fn revoke_expired(&self, id: &str) {
        match revocation::revoke(self.registry.as_ref(), id, self.limits).await {
            Ok(report) if !report.is_complete() => {
                warn!(ticket = id, unconfirmed = report.unconfirmed.len(), "expired ticket partially revoked");
            },
            Ok(report) => debug!(ticket = id, deleted = report.deleted, "removed expired ticket"),
            Err(error) => warn!(ticket = id, %error, "failed to remove expired ticket"),
        }
    }

    /// Consumes a service or proxy ticket and returns who it was issued to.
    ///
    /// Succeeds at most once per ticket, even under concurrent calls.
    ///
    /// # Errors
    ///
    /// Returns [`TicketError::InvalidTicket`] if the ticket is missing, of the
    /// wrong kind, expired, already used, issued for another service, or if
    /// any granting ticket above it has been revoked or has expired. A ticket
    /// presented for the wrong service is still consumed.
    #[tracing::instrument(skip(self))]
    pub async fn validate_service_ticket(&self, st_id: &str, service: &str) -> TicketResult<Assertion> {
        self.validate(st_id, service).await.map(|(assertion, _)| assertion)
    }

    /// Validates a service ticket and hands the service a proxy-granting
    /// ticket chained below the session.
    ///
    /// `proxy_authentication` is the authenticated proxy callback of the
    /// requesting service. The ticket is not consumed if the service may not
    /// proxy.
    ///
    /// # Errors
    ///
    /// - [`TicketError::UnrecognizedService`] if the resolver does not know `service`
    /// - [`TicketError::UnauthorizedProxying`] if the service may not proxy
    /// - anything [`validate_service_ticket`](Self::validate_service_ticket) returns
    #[tracing::instrument(skip(self, proxy_authentication))]
    pub async fn validate_service_ticket_with_proxy(
        &self,
        st_id: &str,
        service: &str,
        proxy_authentication: Authentication,
    ) -> TicketResult<(Assertion, GrantingTicket)> {
        let registered = self.resolve(service).await?;
        if !registered.proxy_allowed {
            debug!(service, "rejected proxy request");
            return Err(TicketError::UnauthorizedProxying { service: service.to_owned() });
        }

        let (assertion, st) = self.validate(st_id, service).await?;
        let pgt = GrantingTicket::proxy(
            self.new_meta(TicketKind::ProxyGranting),
            proxy_authentication,
            &assertion.chained_authentications,
            ProxyOrigin {
                service_ticket_id: st_id.to_owned(),
                granting_ticket_id: st.granting_ticket_id.clone(),
            },
        );

        let pgt_id = pgt.id().to_owned();
        let parent_id = st.granting_ticket_id.as_str();
        let record_pgt = |ticket: &mut Ticket| -> TicketResult<()> {
            let granting = ticket
                .as_granting_mut()
                .ok_or_else(|| TicketError::invalid(st_id, InvalidReason::Revoked))?;
            granting.proxy_granting_tickets.insert(pgt_id.clone());
            Ok(())
        };
        if self.registry.mutate_ticket(parent_id, &record_pgt).await?.is_none() {
            return Err(TicketError::invalid(st_id, InvalidReason::Revoked));
        }
        self.registry.add_ticket(&Ticket::ProxyGranting(pgt.clone())).await?;

        info!(ticket = %pgt_id, service_ticket = st_id, service, "granted proxy-granting ticket");
        Ok((assertion, pgt))
    }

    async fn validate(&self, st_id: &str, service: &str) -> TicketResult<(Assertion, ServiceTicket)> {
        let now = self.now();
        let consume = |ticket: &mut Ticket| -> TicketResult<()> {
            if !TicketKind::Service.accepts(ticket.kind()) {
                return Err(TicketError::invalid(st_id, InvalidReason::WrongType));
            }
            let Some(st) = ticket.as_service_mut() else {
                return Err(TicketError::invalid(st_id, InvalidReason::WrongType));
            };
            if st.is_consumed() {
                return Err(TicketError::invalid(st_id, InvalidReason::AlreadyUsed));
            }
            if st.is_expired_at(now) {
                return Err(TicketError::invalid(st_id, InvalidReason::Expired));
            }
            st.consume(now);
            Ok(())
        };

        let consumed = match self.registry.mutate_ticket(st_id, &consume).await {
            Ok(Some(ticket)) => ticket,
            Ok(None) => {
                debug!(ticket = st_id, "rejected unknown service ticket");
                return Err(TicketError::invalid(st_id, InvalidReason::NotFound));
            },
            Err(error) => {
                debug!(ticket = st_id, %error, "rejected service ticket");
                if error.invalid_reason() == Some(InvalidReason::Expired) {
                    self.discard(st_id).await;
                }
                return Err(error);
            },
        };
        if consumed.is_expired_at(now) {
            self.discard(st_id).await;
        }
        let (Ticket::Service(st) | Ticket::Proxy(st)) = consumed else {
            return Err(TicketError::invalid(st_id, InvalidReason::WrongType));
        };

        if st.service != service {
            debug!(ticket = st_id, expected = %st.service, presented = service, "service mismatch");
            return Err(TicketError::invalid(st_id, InvalidReason::ServiceMismatch));
        }

        let granting = self.resolve_granting_chain(st_id, &st.granting_ticket_id).await?;
        let touch = |ticket: &mut Ticket| -> TicketResult<()> {
            ticket.meta_mut().touch(now);
            Ok(())
        };
        if let Err(error) = self.registry.mutate_ticket(granting.id(), &touch).await {
            warn!(ticket = %granting.id(), %error, "failed to touch granting ticket");
        }

        let assertion = Assertion {
            primary_authentication: granting.root_authentication().clone(),
            chained_authentications: granting.chained_authentications.clone(),
            service: st.service.clone(),
            from_new_login: st.from_new_login,
        };
        info!(ticket = st_id, service, principal = %assertion.principal().id, "validated service ticket");
        Ok((assertion, st))
    }

    /// Returns the immediate granting ticket of `st_id` after checking that
    /// it and every ticket above it are still live.
    async fn resolve_granting_chain(&self, st_id: &str, parent_id: &str) -> TicketResult<GrantingTicket> {
        let revoked = || {
            debug!(ticket = st_id, granting_ticket = parent_id, "granting chain revoked");
            TicketError::invalid(st_id, InvalidReason::Revoked)
        };
        let lookup = |ticket: Option<Ticket>| match ticket {
            Some(Ticket::TicketGranting(t) | Ticket::ProxyGranting(t)) => Some(t),
            _ => None,
        };

        let immediate = lookup(self.registry.get_ticket(parent_id).await?).ok_or_else(revoked)?;
        let mut above = immediate.parent.as_ref().map(|origin| origin.granting_ticket_id.clone());
        let mut depth = 1;
        while let Some(id) = above {
            depth += 1;
            if depth > self.limits.max_depth {
                return Err(revoked());
            }
            let ancestor = lookup(self.registry.get_ticket(&id).await?).ok_or_else(revoked)?;
            above = ancestor.parent.map(|origin| origin.granting_ticket_id);
        }
        Ok(immediate)
    }

    async fn discard(&self, id: &str) {
        if let Err(error) = self.registry.delete_single_ticket(id).await {
            warn!(ticket = id, %error, "failed to remove spent service ticket");
        }
    }

    /// Ends a session: removes the TGT (or PGT) and everything it minted.
    ///
    /// Returns the number of tickets removed; 0 if the ticket does not exist.
    ///
    /// # Errors
    ///
    /// - [`TicketError::InvalidTicket`] with [`InvalidReason::WrongType`] for a
    ///   service or proxy ticket id
    /// - [`TicketError::RevocationPartialFailure`] if some descendants could not
    ///   be confirmed removed; the ticket itself is gone
    #[tracing::instrument(skip(self))]
    pub async fn destroy_ticket_granting_ticket(&self, id: &str) -> TicketResult<usize> {
        match self.registry.find_ticket(id).await? {
            None => return Ok(0),
            Some(ticket) if !ticket.kind().is_granting() => {
                return Err(TicketError::invalid(id, InvalidReason::WrongType));
            },
            Some(_) => {},
        }

        let report = revocation::revoke(self.registry.as_ref(), id, self.limits).await?;
        if !report.is_complete() {
            warn!(ticket = id, unconfirmed = report.unconfirmed.len(), "revocation incomplete");
            return Err(TicketError::RevocationPartialFailure {
                id: id.to_owned(),
                deleted: report.deleted,
                unconfirmed: report.unconfirmed,
            });
        }
        info!(ticket = id, deleted = report.deleted, "destroyed ticket-granting ticket");
        Ok(report.deleted)
    }
}
