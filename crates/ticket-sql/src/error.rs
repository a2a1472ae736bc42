//! Error types for the SQLite ticket registry.

use rusqlite::ErrorCode;
use thiserror::Error;
use ticketd_storage::StorageError;
use ticketd_ticket::ConfigError;

/// Failures while opening a [`SqlTicketRegistry`](crate::SqlTicketRegistry).
///
/// Once open, statement failures surface as [`StorageError`] inside
/// [`TicketError::Storage`](ticketd_ticket::TicketError::Storage).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SqlRegistryError {
    /// The database file could not be opened.
    #[error("Failed to open ticket database: {0}")]
    Open(#[source] rusqlite::Error),

    /// Connection settings or the schema could not be applied.
    #[error("Failed to initialize ticket schema: {0}")]
    Schema(#[source] rusqlite::Error),

    /// The registry configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Maps a SQLite failure onto the shared storage taxonomy.
pub(crate) fn storage_error(error: rusqlite::Error) -> StorageError {
    match error.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
            StorageError::connection_with_source("ticket database busy", error)
        },
        Some(ErrorCode::CannotOpen | ErrorCode::SystemIoFailure | ErrorCode::DiskFull) => {
            StorageError::connection_with_source("ticket database unavailable", error)
        },
        Some(ErrorCode::ConstraintViolation) => StorageError::conflict(),
        _ => match error {
            rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::InvalidColumnType(..)
            | rusqlite::Error::IntegralValueOutOfRange(..) => {
                StorageError::serialization_with_source("malformed ticket row", error)
            },
            other => StorageError::internal_with_source("ticket database error", other),
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use rusqlite::ffi;

    use super::*;

    fn sqlite_failure(code: std::os::raw::c_int) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(ffi::Error::new(code), None)
    }

    #[test]
    fn busy_database_is_transient() {
        let mapped = storage_error(sqlite_failure(ffi::SQLITE_BUSY));
        assert!(matches!(mapped, StorageError::Connection { .. }));
        assert!(mapped.is_transient());
    }

    #[test]
    fn messages_keep_sqlite_detail_in_the_source() {
        let busy = sqlite_failure(ffi::SQLITE_BUSY);
        let detail = busy.to_string();
        let mapped = storage_error(busy);

        assert!(!mapped.to_string().contains(&detail), "display leaked: {mapped}");
        let source = std::error::Error::source(&mapped).map(ToString::to_string);
        assert_eq!(source.as_deref(), Some(detail.as_str()));

        let io = storage_error(sqlite_failure(ffi::SQLITE_IOERR));
        assert!(matches!(io, StorageError::Connection { .. }));
        assert!(std::error::Error::source(&io).is_some());
    }

    #[test]
    fn constraint_violation_is_conflict() {
        let mapped = storage_error(sqlite_failure(ffi::SQLITE_CONSTRAINT));
        assert!(matches!(mapped, StorageError::Conflict));
    }

    #[test]
    fn missing_row_is_internal() {
        let mapped = storage_error(rusqlite::Error::QueryReturnedNoRows);
        assert!(matches!(mapped, StorageError::Internal { .. }));
        assert!(!mapped.is_transient());
    }
}
