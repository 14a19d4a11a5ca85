//! Error types for extpg.

use thiserror::Error;

/// The main error type for adapter operations.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Malformed or missing connection identity or table configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The remote database could not be reached.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The remote engine rejected a statement.
    #[error("Remote query error: {0}")]
    RemoteQuery(String),

    /// The targeted row or version does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A uniqueness or primary-key constraint was violated remotely.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// A caller-supplied predicate, option or record is malformed.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Another writer replaced the head version while a transition was running.
    #[error("Conflict: {0}")]
    Conflict(String),
}

/// Discriminant of [`AdapterError`], handy for matching in callers and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Connection,
    RemoteQuery,
    NotFound,
    ConstraintViolation,
    Validation,
    Conflict,
}

impl AdapterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Connection(_) => ErrorKind::Connection,
            Self::RemoteQuery(_) => ErrorKind::RemoteQuery,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::ConstraintViolation(_) => ErrorKind::ConstraintViolation,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Conflict(_) => ErrorKind::Conflict,
        }
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

impl From<sqlx::Error> for AdapterError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Configuration(e) => Self::Configuration(e.to_string()),
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Self::Connection(err.to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Self::ConstraintViolation(db.message().to_string())
            }
            sqlx::Error::Database(db) => Self::RemoteQuery(db.message().to_string()),
            sqlx::Error::RowNotFound => Self::NotFound(err.to_string()),
            _ => Self::RemoteQuery(err.to_string()),
        }
    }
}

/// Result type alias for adapter operations.
pub type AdapterResult<T> = Result<T, AdapterError>;
