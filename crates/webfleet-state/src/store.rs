//! The durable state capability used by the worker, orchestrators, and API.

use std::time::Duration;

use async_trait::async_trait;

use webfleet_core::SiteStatus;

use crate::error::StateResult;
use crate::types::{JobKind, JobRecord, SiteRecord};

/// Backend for site and job state.
///
/// Every operation either commits atomically or has no effect. The store is
/// the single synchronization point of the system: job-claim exclusivity,
/// lifecycle transition validity, and custom-domain uniqueness are all
/// enforced here, not by in-process locks.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Create a `PENDING` job with zero attempts.
    async fn insert_job(&self, id: &str, kind: JobKind, site: &str) -> StateResult<()>;

    /// Attach a work payload (e.g. a staged archive path) to a job.
    async fn set_job_payload(&self, id: &str, payload: &str) -> StateResult<()>;

    /// Create or update a site row.
    ///
    /// When the row already exists and `status` differs from the current
    /// value, the change must be a legal transition; otherwise the call
    /// fails with [`StateError::InvalidTransition`] and callers go through
    /// [`StateStore::transition_site`] deliberately.
    ///
    /// [`StateError::InvalidTransition`]: crate::StateError::InvalidTransition
    async fn upsert_site(
        &self,
        site: &str,
        domain: &str,
        status: SiteStatus,
        job_id: &str,
    ) -> StateResult<()>;

    /// Move a site to `target`, validating the edge against the transition
    /// matrix inside a single read-modify-write transaction.
    async fn transition_site(&self, site: &str, target: SiteStatus) -> StateResult<()>;

    /// Atomically claim the oldest `PENDING` job with attempts remaining.
    ///
    /// Sets `PROCESSING`, increments `attempts`, stamps `started_at`, and
    /// returns the post-claim record. Uses row locking that skips
    /// already-locked rows, so concurrent claimers never receive the same
    /// job. Returns `None` when nothing is claimable.
    async fn claim_next_job(&self) -> StateResult<Option<JobRecord>>;

    /// Mark a job `COMPLETED`, clear its error, and transition the site to
    /// the kind's final status (`ACTIVE` or `DESTROYED`).
    async fn complete_job(&self, id: &str, site: &str, kind: JobKind) -> StateResult<()>;

    /// Mark a job permanently `FAILED` with the error string.
    ///
    /// The site row is left in its current state so an operator can
    /// inspect what the failed job left behind.
    async fn fail_job(&self, id: &str, site: &str, error: &str) -> StateResult<()>;

    /// Put a `PROCESSING` job back to `PENDING` for the next poll cycle,
    /// recording the error. `attempts` is not reset.
    async fn retry_job(&self, id: &str, error: &str) -> StateResult<()>;

    /// Reset `PROCESSING` jobs whose `started_at` is older than `timeout`
    /// back to `PENDING` with a recovery marker. Returns the count.
    async fn recover_stuck_jobs(&self, timeout: Duration) -> StateResult<u64>;

    /// Whether the site has a job in `PENDING` or `PROCESSING`.
    async fn has_active_job(&self, site: &str) -> StateResult<bool>;

    /// Fail with [`StateError::DomainTaken`] when another non-destroyed
    /// site currently holds `domain` as its custom domain.
    ///
    /// [`StateError::DomainTaken`]: crate::StateError::DomainTaken
    async fn ensure_domain_available(&self, domain: &str, site: &str) -> StateResult<()>;

    /// Commit (`Some`) or clear (`None`) the site's custom domain.
    async fn set_custom_domain(&self, site: &str, domain: Option<&str>) -> StateResult<()>;

    /// Fetch a site row.
    async fn get_site(&self, site: &str) -> StateResult<Option<SiteRecord>>;

    /// All site rows, newest first.
    async fn list_sites(&self) -> StateResult<Vec<SiteRecord>>;

    /// Fetch a job row.
    async fn get_job(&self, id: &str) -> StateResult<Option<JobRecord>>;

    /// Physically remove a `DESTROYED` site row and its jobs.
    async fn hard_delete_site(&self, site: &str) -> StateResult<()>;

    /// Physically remove a job row; rejected while the job is active.
    async fn hard_delete_job(&self, id: &str) -> StateResult<()>;
}
