//! Rollback journal errors.
//!
//! External errors from the database layer (`rusqlite`, `r2d2`) are
//! converted into this error type using the provided `From`
//! implementations; each variant keeps the caller location to facilitate
//! debugging.
use std::panic::Location;

/// Journal error type that encapsulates failures encountered during
/// database operations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The query was malformed or the database rejected it.
    #[error("The rollback journal query failed: {source}, {location}")]
    InvalidQuery {
        source: r2d2_sqlite::rusqlite::Error,
        location: &'static Location<'static>,
    },

    /// A record could not be inserted.
    #[error("Unable to insert record into the rollback journal, {location}")]
    InsertFailed {
        location: &'static Location<'static>,
    },

    /// The r2d2 connection pool failed.
    #[error("Failed to create or use the rollback journal connection pool: {source}, {location}")]
    ConnectionPool {
        source: r2d2::Error,
        location: &'static Location<'static>,
    },

    /// The journal directory could not be prepared.
    #[error("Unable to prepare the rollback journal path: {source}, {location}")]
    Io {
        source: std::io::Error,
        location: &'static Location<'static>,
    },
}

impl From<r2d2_sqlite::rusqlite::Error> for Error {
    #[track_caller]
    fn from(source: r2d2_sqlite::rusqlite::Error) -> Self {
        Self::InvalidQuery {
            source,
            location: Location::caller(),
        }
    }
}

impl From<r2d2::Error> for Error {
    #[track_caller]
    fn from(source: r2d2::Error) -> Self {
        Self::ConnectionPool {
            source,
            location: Location::caller(),
        }
    }
}

impl From<std::io::Error> for Error {
    #[track_caller]
    fn from(source: std::io::Error) -> Self {
        Self::Io {
            source,
            location: Location::caller(),
        }
    }
}
