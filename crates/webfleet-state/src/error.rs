//! Error types for webfleet-state.

use webfleet_core::SiteStatus;

/// Result type alias using [`StateError`].
pub type StateResult<T> = Result<T, StateError>;

/// Errors produced by the state store.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Underlying database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Site row does not exist.
    #[error("site not found: {0}")]
    SiteNotFound(String),

    /// Job row does not exist.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// Attempted lifecycle edge is not in the transition matrix.
    #[error("invalid state transition: cannot transition from {from} to {to}")]
    InvalidTransition {
        /// Current status.
        from: SiteStatus,
        /// Attempted target status.
        to: SiteStatus,
    },

    /// Custom domain is already held by another site.
    #[error("domain already claimed")]
    DomainTaken {
        /// Domain that was requested.
        domain: String,
        /// Site currently holding it.
        held_by: String,
    },

    /// A guard on the operation failed (e.g. hard delete of a live row).
    #[error("{0}")]
    Conflict(String),

    /// Stored value could not be interpreted.
    #[error("corrupt state row: {0}")]
    Corrupt(String),
}

impl StateError {
    /// Create a conflict error.
    #[must_use]
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }
}
