//! Error types for webhook delivery operations.
//!
//! Separates what the dispatch engine absorbs on its own (lock contention,
//! transient delivery failures, exhausted retries) from what it surfaces:
//! operator mistakes and storage outages.

use std::{fmt, time::Duration};

use hookrelay_core::CoreError;
use thiserror::Error;

/// Result type alias for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Comprehensive error types for webhook delivery operations.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Another worker or process holds a live lock on the resource.
    #[error("lock contention on {key}")]
    LockContention {
        /// Key of the contended lock
        key: String,
    },

    /// Release attempted by a caller that no longer holds the lock.
    #[error("lock {key} not held by {holder}")]
    LockNotHeld {
        /// Key of the lock being released
        key: String,
        /// Holder token presented by the caller
        holder: String,
    },

    /// Network-level connectivity failure.
    #[error("network connection failed: {message}")]
    NetworkError {
        /// Error message describing the network failure
        message: String,
    },

    /// HTTP request timeout exceeded.
    #[error("request timeout after {timeout_seconds}s")]
    Timeout {
        /// Number of seconds before the request timed out
        timeout_seconds: u64,
    },

    /// Consumer answered with a non-2xx status.
    #[error("consumer responded with HTTP {status_code}")]
    HttpStatus {
        /// HTTP status code returned by the consumer
        status_code: u16,
        /// Response body content
        body: String,
    },

    /// All delivery attempts exhausted.
    #[error("delivery failed after {attempts} attempts")]
    RetriesExhausted {
        /// Number of attempts made
        attempts: u32,
    },

    /// Referenced job, consumer or message does not exist.
    #[error("not found: {message}")]
    NotFound {
        /// What was looked up
        message: String,
    },

    /// Operation is not allowed in the job's current state.
    #[error("invalid state: {message}")]
    InvalidState {
        /// Why the transition was rejected
        message: String,
    },

    /// Caller supplied malformed input such as a bad page cursor.
    #[error("invalid input: {message}")]
    InvalidInput {
        /// Description of the bad input
        message: String,
    },

    /// Lock or job storage failed; the engine cannot make safe progress.
    #[error("storage error: {message}")]
    StorageError {
        /// Storage error message
        message: String,
    },

    /// Invalid engine or client configuration.
    #[error("invalid configuration: {message}")]
    ConfigurationError {
        /// Configuration error message
        message: String,
    },

    /// The engine is shutting down and no longer accepts work.
    #[error("delivery engine is shutting down")]
    ShuttingDown,

    /// Workers did not stop within the shutdown timeout.
    #[error("shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Timeout that elapsed
        timeout: Duration,
    },

    /// A worker task panicked.
    #[error("worker {worker_id} panicked: {error}")]
    WorkerPanic {
        /// Identifier of the panicked worker
        worker_id: usize,
        /// Panic description from the join error
        error: String,
    },
}

impl DeliveryError {
    /// Creates a network error from a message.
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout_seconds: u64) -> Self {
        Self::Timeout { timeout_seconds }
    }

    /// Creates an error for a non-2xx consumer response.
    pub fn http_status(status_code: u16, body: impl Into<String>) -> Self {
        Self::HttpStatus { status_code, body: body.into() }
    }

    /// Creates a retries exhausted error.
    pub fn retries_exhausted(attempts: u32) -> Self {
        Self::RetriesExhausted { attempts }
    }

    /// Creates a not found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound { message: message.into() }
    }

    /// Creates an invalid state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState { message: message.into() }
    }

    /// Creates an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput { message: message.into() }
    }

    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::StorageError { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError { message: message.into() }
    }

    /// Whether this is a failed delivery attempt that the retry scheduler
    /// absorbs.
    ///
    /// Every non-2xx response counts, 4xx included: a consumer that is down
    /// or misrouted often answers 404 until it is fixed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NetworkError { .. } | Self::Timeout { .. } | Self::HttpStatus { .. })
    }

    /// Whether the error only means another owner holds the resource.
    pub fn is_contention(&self) -> bool {
        matches!(self, Self::LockContention { .. })
    }
}

impl From<CoreError> for DeliveryError {
    fn from(error: CoreError) -> Self {
        match error {
            CoreError::LockContention { key } => Self::LockContention { key },
            CoreError::LockNotHeld { key, holder } => Self::LockNotHeld { key, holder },
            CoreError::NotFound(message) => Self::NotFound { message },
            CoreError::InvalidState(message) => Self::InvalidState { message },
            CoreError::InvalidInput(message) => Self::InvalidInput { message },
            CoreError::Database(message) | CoreError::ConstraintViolation(message) => {
                Self::StorageError { message }
            },
        }
    }
}

/// Category of delivery error, attached to log events as `category`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Lock held elsewhere.
    Contention,
    /// Network connectivity issues and timeouts.
    Network,
    /// Non-2xx consumer responses.
    Http,
    /// Attempts used up.
    Exhausted,
    /// Operator action on a missing or wrongly-stated job.
    Operator,
    /// Storage operations.
    Storage,
    /// Configuration problems.
    Configuration,
    /// Engine shutting down or a worker task failing.
    Lifecycle,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(error: &DeliveryError) -> Self {
        match error {
            DeliveryError::LockContention { .. } | DeliveryError::LockNotHeld { .. } => {
                Self::Contention
            },
            DeliveryError::NetworkError { .. } | DeliveryError::Timeout { .. } => Self::Network,
            DeliveryError::HttpStatus { .. } => Self::Http,
            DeliveryError::RetriesExhausted { .. } => Self::Exhausted,
            DeliveryError::NotFound { .. }
            | DeliveryError::InvalidState { .. }
            | DeliveryError::InvalidInput { .. } => Self::Operator,
            DeliveryError::StorageError { .. } => Self::Storage,
            DeliveryError::ConfigurationError { .. } => Self::Configuration,
            DeliveryError::ShuttingDown
            | DeliveryError::ShutdownTimeout { .. }
            | DeliveryError::WorkerPanic { .. } => Self::Lifecycle,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Contention => write!(f, "contention"),
            Self::Network => write!(f, "network"),
            Self::Http => write!(f, "http"),
            Self::Exhausted => write!(f, "exhausted"),
            Self::Operator => write!(f, "operator"),
            Self::Storage => write!(f, "storage"),
            Self::Configuration => write!(f, "configuration"),
            Self::Lifecycle => write!(f, "lifecycle"),
        }
    }
}
