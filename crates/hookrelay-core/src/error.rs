//! Error types for core broker operations.
//!
//! Storage and state machine failures share one taxonomy so callers can tell
//! lock contention and operator mistakes apart from infrastructure outages.

use thiserror::Error;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for internal operations.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(String),

    /// Entity not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Constraint violation.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Entity is not in a state that allows the requested transition.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A live lock is already held on the key by another holder.
    #[error("Lock contention on {key}")]
    LockContention {
        /// Lock key that could not be acquired
        key: String,
    },

    /// Release was attempted by a caller that does not hold the lock.
    #[error("Lock {key} is not held by {holder}")]
    LockNotHeld {
        /// Lock key that was being released
        key: String,
        /// Holder token presented by the caller
        holder: String,
    },
}

impl CoreError {
    /// Returns true when the error only means somebody else owns the
    /// resource right now.
    pub const fn is_contention(&self) -> bool {
        matches!(self, Self::LockContention { .. })
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("requested entity not found".to_string()),
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::ConstraintViolation(format!("unique constraint violation: {}", db_err))
            },
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                Self::ConstraintViolation(format!("foreign key constraint violation: {}", db_err))
            },
            sqlx::Error::Database(db_err) if db_err.is_check_violation() => {
                Self::ConstraintViolation(format!("check constraint violation: {}", db_err))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}
