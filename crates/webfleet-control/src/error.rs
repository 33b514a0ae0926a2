//! Error taxonomy for the control plane.
//!
//! Kinds map one-to-one onto the API's status codes: validation failures
//! are rejected before any side effect (400), guard failures conflict
//! (409), lifecycle violations conflict (409), and adapter failures are
//! the sole transient category the worker retries.

use webfleet_core::ValidationError;
use webfleet_infra::InfraError;
use webfleet_state::StateError;

/// Result type alias using [`ControlError`].
pub type ControlResult<T> = Result<T, ControlError>;

/// Errors produced by the control plane.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    /// Input rejected before any side effect.
    #[error("{0}")]
    Validation(String),

    /// A state or uniqueness guard failed.
    #[error("{0}")]
    Conflict(String),

    /// Referenced site or job does not exist.
    #[error("{0}")]
    NotFound(String),

    /// State store failure (including lifecycle violations).
    #[error(transparent)]
    State(#[from] StateError),

    /// Infrastructure adapter failure.
    #[error(transparent)]
    Infra(#[from] InfraError),

    /// A multi-step transaction failed and its completed steps were
    /// undone.
    #[error("{operation} failed (rolled back): {reason}")]
    RolledBack {
        /// Which transaction rolled back.
        operation: &'static str,
        /// The original failure.
        reason: String,
    },

    /// Infrastructure was changed but the durable commit failed;
    /// retrying the same request converges.
    #[error("{0}")]
    AppliedNotPersisted(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ControlError {
    /// Create a validation error.
    #[must_use]
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a conflict error.
    #[must_use]
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a not-found error.
    #[must_use]
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<ValidationError> for ControlError {
    fn from(e: ValidationError) -> Self {
        Self::Validation(e.to_string())
    }
}
