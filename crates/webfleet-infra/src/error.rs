//! Error types for webfleet-infra.

/// Result type alias using [`InfraError`].
pub type InfraResult<T> = Result<T, InfraError>;

/// Errors produced by infrastructure adapters.
///
/// `Adapter` is the sole transient category: orchestrators treat it as
/// retriable and trigger compensation. `NotFound` is distinguished so
/// teardown paths can tolerate already-absent resources. `Invariant`
/// means an adapter succeeded but reported impossible state; it is never
/// retried.
#[derive(Debug, thiserror::Error)]
pub enum InfraError {
    /// Target resource does not exist.
    #[error("{subsystem}: {resource} not found")]
    NotFound {
        /// Adapter subsystem tag (e.g. "docker", "edge").
        subsystem: &'static str,
        /// The missing resource name.
        resource: String,
    },

    /// Infrastructure call failed.
    #[error("{subsystem} error: {message}")]
    Adapter {
        /// Adapter subsystem tag.
        subsystem: &'static str,
        /// Underlying failure description.
        message: String,
    },

    /// Adapter succeeded but returned impossible state.
    #[error("{subsystem} invariant violation: {message}")]
    Invariant {
        /// Adapter subsystem tag.
        subsystem: &'static str,
        /// What was observed.
        message: String,
    },
}

impl InfraError {
    /// Create an adapter error.
    #[must_use]
    pub fn adapter(subsystem: &'static str, message: impl Into<String>) -> Self {
        Self::Adapter {
            subsystem,
            message: message.into(),
        }
    }

    /// Create a not-found error.
    #[must_use]
    pub fn not_found(subsystem: &'static str, resource: impl Into<String>) -> Self {
        Self::NotFound {
            subsystem,
            resource: resource.into(),
        }
    }

    /// Create an invariant-violation error.
    #[must_use]
    pub fn invariant(subsystem: &'static str, message: impl Into<String>) -> Self {
        Self::Invariant {
            subsystem,
            message: message.into(),
        }
    }

    /// Whether this error reports an already-absent resource.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Drop the error if it only says the resource was already absent.
///
/// Teardown steps use this to stay idempotent: removing something that is
/// already gone is success.
pub fn tolerate_missing(result: InfraResult<()>) -> InfraResult<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}
