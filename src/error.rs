use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure taxonomy shared by the publish and consume paths.
///
/// `Transient` and `HandlerFailure` are recovered locally through retry.
/// `Permanent`, `Exhausted` and `Abandoned` are surfaced to the caller
/// through the publish result or to the operator through a log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Retryable infrastructure condition (broker unavailable, leader not ready).
    Transient,
    /// Malformed or oversized message; never retried.
    Permanent,
    /// Retry budget spent.
    Exhausted,
    /// In-flight work dropped at shutdown.
    Abandoned,
    /// User handler returned an error.
    HandlerFailure,
}

/// Errors produced by the delivery core.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// Retryable broker condition.
    #[error("transient broker error: {0}")]
    Transient(String),

    /// Non-retryable failure, e.g. message too large or not serializable.
    #[error("permanent error: {0}")]
    Permanent(String),

    /// Transient failures persisted past the retry budget.
    #[error("delivery exhausted after {attempts} attempts (last error: {last_error})")]
    Exhausted { attempts: u32, last_error: String },

    /// Delivery was still in flight when the publisher shut down.
    #[error("delivery abandoned at shutdown")]
    Abandoned,

    /// User handler failed.
    #[error("handler failure: {0}")]
    HandlerFailure(String),

    /// The publisher no longer accepts new work.
    #[error("publisher is closed")]
    Closed,

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl DeliveryError {
    // ---
    /// Map this error onto the failure taxonomy.
    ///
    /// `Closed` and `Config` are rejections at the API boundary; they are
    /// reported as `Permanent` since retrying them cannot succeed.
    pub fn kind(&self) -> ErrorKind {
        // ---
        match self {
            DeliveryError::Transient(_) => ErrorKind::Transient,
            DeliveryError::Permanent(_) | DeliveryError::Closed | DeliveryError::Config(_) => {
                ErrorKind::Permanent
            }
            DeliveryError::Exhausted { .. } => ErrorKind::Exhausted,
            DeliveryError::Abandoned => ErrorKind::Abandoned,
            DeliveryError::HandlerFailure(_) => ErrorKind::HandlerFailure,
        }
    }

    /// Returns `true` if the operation may succeed when retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeliveryError::Transient(_))
    }
}

impl From<serde_json::Error> for DeliveryError {
    fn from(err: serde_json::Error) -> Self {
        // ---
        DeliveryError::Permanent(format!("serialization error: {err}"))
    }
}

/// Result type alias for delivery operations
pub type Result<T> = std::result::Result<T, DeliveryError>;
