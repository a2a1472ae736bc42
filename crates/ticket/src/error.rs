//! Ticket subsystem errors.
//!
//! Every failure a protocol adapter can observe is a [`TicketError`]. Storage
//! failures arrive wrapped as [`TicketError::Storage`] and carry no
//! backend-specific detail beyond the [`StorageError`] taxonomy.
//!
//! | Variant | Meaning | Retried |
//! |---------|---------|---------|
//! | [`InvalidTicket`](TicketError::InvalidTicket) | missing, expired, used, wrong type, wrong service, revoked | never |
//! | [`TypeMismatch`](TicketError::TypeMismatch) | id resolves to a ticket of another kind | never |
//! | [`DuplicateTicket`](TicketError::DuplicateTicket) | id collision on create | caller mints a new id |
//! | [`UnrecognizedService`](TicketError::UnrecognizedService) | service resolver rejected the service | never |
//! | [`Storage`](TicketError::Storage) | backend transport failure | by the backend client only |
//! | [`RevocationPartialFailure`](TicketError::RevocationPartialFailure) | some descendants not confirmed removed | cleanup sweep |

use std::fmt;

use thiserror::Error;
use ticketd_storage::StorageError;

use crate::ticket::TicketKind;

/// Result type alias for ticket operations.
pub type TicketResult<T> = Result<T, TicketError>;

/// Why a presented ticket was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum InvalidReason {
    /// No ticket with that id exists.
    NotFound,
    /// The ticket's expiration policy reports it expired.
    Expired,
    /// A single-use ticket was already consumed.
    AlreadyUsed,
    /// The id names a ticket of a kind this operation does not accept.
    WrongType,
    /// The ticket was issued for a different service.
    ServiceMismatch,
    /// An ancestor in the granting chain is gone or expired.
    Revoked,
}

impl fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotFound => "not found",
            Self::Expired => "expired",
            Self::AlreadyUsed => "already used",
            Self::WrongType => "wrong ticket type",
            Self::ServiceMismatch => "issued for another service",
            Self::Revoked => "granting ticket revoked",
        })
    }
}

/// Errors produced by the ticket subsystem.
///
/// # Non-exhaustive
///
/// Downstream match expressions must include a wildcard arm (`_ =>`).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TicketError {
    /// The presented ticket cannot be used.
    #[error("Ticket {id} is invalid: {reason}")]
    InvalidTicket {
        /// The presented ticket id.
        id: String,
        /// Why it was rejected.
        reason: InvalidReason,
    },

    /// A registry lookup found the id but with an incompatible kind.
    #[error("Ticket {id} is a {actual} ticket, expected {expected}")]
    TypeMismatch {
        /// The requested id.
        id: String,
        /// The kind the caller asked for.
        expected: TicketKind,
        /// The kind actually stored.
        actual: TicketKind,
    },

    /// A ticket with this id is already stored.
    #[error("Ticket {id} already exists")]
    DuplicateTicket {
        /// The colliding id.
        id: String,
    },

    /// The service resolver does not know the service.
    #[error("Service {service} is not recognized")]
    UnrecognizedService {
        /// The requested service id.
        service: String,
    },

    /// The service requires fresh credentials and refuses SSO reuse.
    #[error("Service {service} does not allow single sign-on")]
    UnauthorizedSsoService {
        /// The requested service id.
        service: String,
    },

    /// The service may not obtain proxy-granting tickets.
    #[error("Service {service} is not authorized to proxy")]
    UnauthorizedProxying {
        /// The requested service id.
        service: String,
    },

    /// Re-presented credentials belong to a different principal than the session.
    #[error("Principal {presented} does not own ticket {id}")]
    PrincipalMismatch {
        /// The granting ticket id.
        id: String,
        /// The principal of the re-presented authentication.
        presented: String,
    },

    /// The id's prefix does not name any catalog entry.
    #[error("Ticket id {id} has no registered prefix")]
    UnknownTicketPrefix {
        /// The offending id.
        id: String,
    },

    /// The storage backend failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// The root ticket was deleted but some descendants were not confirmed removed.
    #[error("Revoked {id} but {} descendant(s) were not confirmed removed", unconfirmed.len())]
    RevocationPartialFailure {
        /// The revoked ticket id.
        id: String,
        /// Number of tickets that were deleted.
        deleted: usize,
        /// Descendant ids whose removal could not be confirmed.
        unconfirmed: Vec<String>,
    },
}

impl TicketError {
    /// Creates an `InvalidTicket` error.
    #[must_use]
    pub fn invalid(id: impl Into<String>, reason: InvalidReason) -> Self {
        Self::InvalidTicket { id: id.into(), reason }
    }

    /// Creates a `DuplicateTicket` error.
    #[must_use]
    pub fn duplicate(id: impl Into<String>) -> Self {
        Self::DuplicateTicket { id: id.into() }
    }

    /// Creates an `UnknownTicketPrefix` error.
    #[must_use]
    pub fn unknown_prefix(id: impl Into<String>) -> Self {
        Self::UnknownTicketPrefix { id: id.into() }
    }

    /// Returns the rejection reason if this is an `InvalidTicket` error.
    #[must_use]
    pub fn invalid_reason(&self) -> Option<InvalidReason> {
        match self {
            Self::InvalidTicket { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    /// Whether a protocol adapter should present this as an authentication failure.
    ///
    /// Everything except backend failures is.
    #[must_use]
    pub fn is_authentication_failure(&self) -> bool {
        !matches!(self, Self::Storage(_))
    }
}

/// Errors produced when a configuration value fails validation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    /// A numeric or duration field is below its minimum.
    #[error("{field} must be at least {min}, got {value}")]
    BelowMinimum {
        /// The offending field.
        field: &'static str,
        /// The minimum accepted value.
        min: String,
        /// The rejected value.
        value: String,
    },

    /// A field holds a value that is not usable.
    #[error("{field} is invalid: {reason}")]
    Invalid {
        /// The offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}
