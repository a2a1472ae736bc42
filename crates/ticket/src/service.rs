//! Service resolution.
//!
//! Deciding which registered application a request belongs to lives outside
//! this crate. The engine only needs the [`ServiceResolver`] answer: whether
//! the service is known, whether it accepts SSO reuse, and whether it may
//! obtain proxy-granting tickets.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::TicketResult;

/// Policy of a registered service as seen by the ticket engine.
#[derive(Debug, Clone, PartialEq, Eq, bon::Builder)]
pub struct RegisteredService {
    /// The service identifier tickets are issued for.
    #[builder(into)]
    pub id: String,
    /// Whether an existing session may be reused without fresh credentials.
    #[builder(default = true)]
    pub sso_enabled: bool,
    /// Whether the service may request proxy-granting tickets.
    #[builder(default = false)]
    pub proxy_allowed: bool,
}

/// Looks up registered services.
#[async_trait]
pub trait ServiceResolver: Send + Sync {
    /// Returns the registered service for `service`, or `None` if it is unknown.
    async fn resolve(&self, service: &str) -> TicketResult<Option<RegisteredService>>;
}

/// A fixed, in-process set of registered services.
#[derive(Debug, Default)]
pub struct InMemoryServiceResolver {
    services: RwLock<HashMap<String, RegisteredService>>,
}

impl InMemoryServiceResolver {
    /// Creates an empty resolver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) a service.
    pub fn register(&self, service: RegisteredService) {
        self.services.write().insert(service.id.clone(), service);
    }

    /// Builder-style [`register`](Self::register).
    #[must_use]
    pub fn with(self, service: RegisteredService) -> Self {
        self.register(service);
        self
    }
}

#[async_trait]
impl ServiceResolver for InMemoryServiceResolver {
    async fn resolve(&self, service: &str) -> TicketResult<Option<RegisteredService>> {
        Ok(self.services.read().get(service).cloned())
    }
}
