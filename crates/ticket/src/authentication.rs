//! Authentication results handed to the ticket subsystem by the login flow.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Multi-valued attribute map. Ordered so serialized payloads are deterministic.
pub type Attributes = BTreeMap<String, Vec<String>>;

/// An authenticated identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Stable principal identifier, e.g. a username.
    pub id: String,
    /// Attributes resolved for the principal.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: Attributes,
}

impl Principal {
    /// Creates a principal with no attributes.
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), attributes: Attributes::new() }
    }
}

/// The outcome of a successful credential validation.
///
/// # Example
///
/// ```
/// use ticketd_ticket::{Authentication, Principal};
///
/// let auth = Authentication::builder()
///     .principal(Principal::new("casuser"))
///     .handlers(vec!["password".into()])
///     .build();
/// assert_eq!(auth.principal.id, "casuser");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
pub struct Authentication {
    /// Who authenticated.
    pub principal: Principal,
    /// Names of the handlers that succeeded.
    #[builder(default)]
    #[serde(default)]
    pub handlers: Vec<String>,
    /// When authentication completed.
    #[builder(default = Utc::now())]
    pub authenticated_at: DateTime<Utc>,
    /// Authentication-level attributes (method, assurance, ...).
    #[builder(default)]
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: Attributes,
}
