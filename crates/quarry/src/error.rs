//! Error types for quarry
//!
//! Errors come in two families. [`BuildError`] covers everything detected while a
//! query is being built or compiled; it never reaches the database and is never
//! worth retrying. [`OrmError`] wraps it together with execution-time failures.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for quarry operations
pub type OrmResult<T> = Result<T, OrmError>;

/// Errors detected before any I/O happens.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    /// An operator was applied to operands it cannot accept
    #[error("Invalid expression: {0}")]
    InvalidExpression(String),

    /// No declared relation links the two record types
    #[error("No relation between '{from}' and '{to}'")]
    UnresolvedRelation { from: String, to: String },

    /// A column's table is not part of the FROM/JOIN set
    #[error("Column '{table}.{column}' is not in scope")]
    UnresolvedColumn { table: String, column: String },

    /// A name that is not a declared field of the record type
    #[error("'{record}' has no field '{field}'")]
    UnknownField { record: String, field: String },

    /// INSERT ... SELECT with mismatched column counts
    #[error("Arity mismatch: expected {expected} columns, got {got}")]
    ArityMismatch { expected: usize, got: usize },

    /// Bad argument to a builder method
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// UPDATE/DELETE without a predicate and without `allow_unfiltered()`
    #[error(
        "{statement} on '{table}' has no WHERE clause; call allow_unfiltered() to affect every row"
    )]
    UnfilteredMutation { statement: &'static str, table: String },
}

impl BuildError {
    pub fn invalid_expression(message: impl Into<String>) -> Self {
        Self::InvalidExpression(message.into())
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn unknown_field(record: impl Into<String>, field: impl Into<String>) -> Self {
        Self::UnknownField {
            record: record.into(),
            field: field.into(),
        }
    }
}

/// Error types for database operations
#[derive(Debug, Error)]
pub enum OrmError {
    /// Query construction or compilation failed
    #[error(transparent)]
    Build(#[from] BuildError),

    /// Database connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Query execution error
    #[error("Query error: {0}")]
    Query(#[from] tokio_postgres::Error),

    /// Row not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// More than one row where exactly one was required
    #[error("Expected exactly one row, got {0}")]
    MultipleResults(usize),

    /// Unique constraint violation
    #[error("Unique constraint violation: {0}")]
    UniqueViolation(String),

    /// Foreign key constraint violation
    #[error("Foreign key violation: {0}")]
    ForeignKeyViolation(String),

    /// Check constraint violation
    #[error("Check constraint violation: {0}")]
    CheckViolation(String),

    /// Serialization failure or deadlock; the transaction can be retried
    #[error("Transaction conflict: {0}")]
    TransactionConflict(String),

    /// Row decode/mapping error
    #[error("Decode error on column '{column}': {message}")]
    Decode { column: String, message: String },

    /// Pool error
    #[cfg(feature = "pool")]
    #[error("Pool error: {0}")]
    Pool(String),

    /// Statement timeout error
    #[error("Query timeout after {0:?}")]
    Timeout(Duration),

    /// Other errors
    #[error("{0}")]
    Other(String),
}

impl OrmError {
    /// Create a decode error for a specific column
    pub fn decode(column: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Decode {
            column: column.into(),
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Check if the error was raised before any I/O
    pub fn is_build_error(&self) -> bool {
        matches!(self, Self::Build(_))
    }

    /// Check if this is a unique violation error
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Self::UniqueViolation(_))
    }

    /// Check if this is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Check if this is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Connection failures and transaction conflicts may succeed when the caller
    /// runs the whole unit of work again. Nothing in the crate retries on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::TransactionConflict(_))
    }

    /// Parse a tokio_postgres error into a more specific OrmError
    pub fn from_db_error(err: tokio_postgres::Error) -> Self {
        if err.is_closed() {
            return Self::Connection(err.to_string());
        }
        if let Some(db_err) = err.as_db_error() {
            let constraint = db_err.constraint().unwrap_or("unknown");
            let message = db_err.message();
            let code = db_err.code().code();

            match code {
                "23505" => return Self::UniqueViolation(format!("{constraint}: {message}")),
                "23503" => return Self::ForeignKeyViolation(format!("{constraint}: {message}")),
                "23514" => return Self::CheckViolation(format!("{constraint}: {message}")),
                "40001" | "40P01" => return Self::TransactionConflict(message.to_string()),
                _ if code.starts_with("08") => return Self::Connection(message.to_string()),
                _ => {}
            }
        }
        Self::Query(err)
    }
}

#[cfg(feature = "pool")]
impl From<deadpool_postgres::PoolError> for OrmError {
    fn from(err: deadpool_postgres::PoolError) -> Self {
        Self::Pool(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_errors_are_flagged_and_not_retryable() {
        let err: OrmError = BuildError::invalid_argument("page must be >= 1").into();
        assert!(err.is_build_error());
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "Invalid argument: page must be >= 1");
    }

    #[test]
    fn conflicts_are_retryable() {
        assert!(OrmError::TransactionConflict("deadlock".into()).is_retryable());
        assert!(OrmError::Connection("reset".into()).is_retryable());
        assert!(!OrmError::UniqueViolation("users_username_key".into()).is_retryable());
    }

    #[test]
    fn unfiltered_mutation_message_names_the_table() {
        let err = BuildError::UnfilteredMutation {
            statement: "DELETE",
            table: "users".into(),
        };
        assert!(err.to_string().starts_with("DELETE on 'users' has no WHERE clause"));
    }
}
