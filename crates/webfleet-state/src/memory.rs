//! In-memory state store for testing.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use webfleet_core::SiteStatus;

use crate::error::{StateError, StateResult};
use crate::store::StateStore;
use crate::types::{JobKind, JobRecord, JobStatus, SiteRecord};

/// Marker recorded on jobs rescued by startup recovery.
const RECOVERY_MARKER: &str = "recovered: was stuck in PROCESSING";

#[derive(Debug, Default)]
struct Inner {
    sites: HashMap<String, SiteRecord>,
    jobs: HashMap<String, JobRecord>,
    /// Insertion order of job ids; tie-break for equal `created_at`.
    job_order: Vec<String>,
}

/// In-memory state store with the same semantics as [`MySqlStore`].
///
/// Not suitable for production use; data is lost when the process exits.
/// The single mutex serializes every operation, which matches the
/// transactional guarantees the MariaDB store gets from row locking.
///
/// [`MySqlStore`]: crate::MySqlStore
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StateResult<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| StateError::Corrupt("lock poisoned".to_owned()))
    }

    /// Test support: shift a job's `started_at` into the past, as if it
    /// had been claimed `by` ago.
    pub fn backdate_started_at(&self, id: &str, by: chrono::Duration) {
        if let Ok(mut inner) = self.inner.lock() {
            if let Some(job) = inner.jobs.get_mut(id) {
                job.started_at = Some(Utc::now() - by);
            }
        }
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn insert_job(&self, id: &str, kind: JobKind, site: &str) -> StateResult<()> {
        let mut inner = self.lock()?;

        if inner.jobs.contains_key(id) {
            return Err(StateError::conflict(format!("job {id} already exists")));
        }

        let now = Utc::now();
        inner.jobs.insert(
            id.to_owned(),
            JobRecord {
                id: id.to_owned(),
                kind,
                site: site.to_owned(),
                status: JobStatus::Pending,
                attempts: 0,
                max_attempts: 3,
                error: None,
                payload: None,
                created_at: now,
                updated_at: now,
                started_at: None,
                completed_at: None,
            },
        );
        inner.job_order.push(id.to_owned());
        Ok(())
    }

    async fn set_job_payload(&self, id: &str, payload: &str) -> StateResult<()> {
        let mut inner = self.lock()?;
        let job = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| StateError::JobNotFound(id.to_owned()))?;
        job.payload = Some(payload.to_owned());
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn upsert_site(
        &self,
        site: &str,
        domain: &str,
        status: SiteStatus,
        job_id: &str,
    ) -> StateResult<()> {
        let mut inner = self.lock()?;
        let now = Utc::now();

        match inner.sites.get_mut(site) {
            None => {
                inner.sites.insert(
                    site.to_owned(),
                    SiteRecord {
                        site: site.to_owned(),
                        domain: domain.to_owned(),
                        custom_domain: None,
                        status,
                        job_id: job_id.to_owned(),
                        created_at: now,
                        updated_at: now,
                    },
                );
            }
            Some(record) => {
                if record.status != status && !record.status.can_transition_to(status) {
                    return Err(StateError::InvalidTransition {
                        from: record.status,
                        to: status,
                    });
                }
                record.domain = domain.to_owned();
                record.status = status;
                record.job_id = job_id.to_owned();
                record.updated_at = now;
            }
        }
        Ok(())
    }

    async fn transition_site(&self, site: &str, target: SiteStatus) -> StateResult<()> {
        let mut inner = self.lock()?;
        let record = inner
            .sites
            .get_mut(site)
            .ok_or_else(|| StateError::SiteNotFound(site.to_owned()))?;

        if !record.status.can_transition_to(target) {
            return Err(StateError::InvalidTransition {
                from: record.status,
                to: target,
            });
        }

        record.status = target;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn claim_next_job(&self) -> StateResult<Option<JobRecord>> {
        let mut inner = self.lock()?;

        // Oldest claimable pending job; insertion order breaks timestamp ties.
        let next_id = inner
            .job_order
            .iter()
            .enumerate()
            .filter_map(|(order, id)| inner.jobs.get(id).map(|job| (order, job)))
            .filter(|(_, j)| j.status == JobStatus::Pending && j.attempts < j.max_attempts)
            .min_by_key(|(order, j)| (j.created_at, *order))
            .map(|(_, j)| j.id.clone());

        let Some(id) = next_id else {
            return Ok(None);
        };

        let now = Utc::now();
        let job = inner.jobs.get_mut(&id).ok_or_else(|| {
            StateError::Corrupt("job order referenced a missing job".to_owned())
        })?;
        job.status = JobStatus::Processing;
        job.attempts += 1;
        job.started_at = Some(now);
        job.updated_at = now;

        Ok(Some(job.clone()))
    }

    async fn complete_job(&self, id: &str, site: &str, kind: JobKind) -> StateResult<()> {
        {
            let mut inner = self.lock()?;
            let now = Utc::now();
            let job = inner
                .jobs
                .get_mut(id)
                .ok_or_else(|| StateError::JobNotFound(id.to_owned()))?;
            job.status = JobStatus::Completed;
            job.error = None;
            job.completed_at = Some(now);
            job.updated_at = now;
        }

        self.transition_site(site, kind.completed_site_status())
            .await
    }

    async fn fail_job(&self, id: &str, _site: &str, error: &str) -> StateResult<()> {
        let mut inner = self.lock()?;
        let job = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| StateError::JobNotFound(id.to_owned()))?;
        job.status = JobStatus::Failed;
        job.error = Some(error.to_owned());
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn retry_job(&self, id: &str, error: &str) -> StateResult<()> {
        let mut inner = self.lock()?;
        let job = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| StateError::JobNotFound(id.to_owned()))?;
        job.status = JobStatus::Pending;
        job.error = Some(format!("attempt failed: {error}"));
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn recover_stuck_jobs(&self, timeout: Duration) -> StateResult<u64> {
        let mut inner = self.lock()?;
        let cutoff = Utc::now()
            - chrono::Duration::from_std(timeout)
                .map_err(|e| StateError::Corrupt(format!("stuck-job timeout out of range: {e}")))?;

        let mut recovered = 0;
        for job in inner.jobs.values_mut() {
            if job.status == JobStatus::Processing
                && job.started_at.is_some_and(|started| started < cutoff)
            {
                job.status = JobStatus::Pending;
                job.error = Some(RECOVERY_MARKER.to_owned());
                job.updated_at = Utc::now();
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn has_active_job(&self, site: &str) -> StateResult<bool> {
        let inner = self.lock()?;
        Ok(inner
            .jobs
            .values()
            .any(|j| j.site == site && j.status.is_active()))
    }

    async fn ensure_domain_available(&self, domain: &str, site: &str) -> StateResult<()> {
        let inner = self.lock()?;
        let holder = inner.sites.values().find(|s| {
            s.site != site
                && s.status != SiteStatus::Destroyed
                && s.custom_domain.as_deref() == Some(domain)
        });

        match holder {
            Some(holder) => Err(StateError::DomainTaken {
                domain: domain.to_owned(),
                held_by: holder.site.clone(),
            }),
            None => Ok(()),
        }
    }

    async fn set_custom_domain(&self, site: &str, domain: Option<&str>) -> StateResult<()> {
        let mut inner = self.lock()?;

        if let Some(domain) = domain {
            if let Some(holder) = inner.sites.values().find(|s| {
                s.site != site
                    && s.status != SiteStatus::Destroyed
                    && s.custom_domain.as_deref() == Some(domain)
            }) {
                return Err(StateError::DomainTaken {
                    domain: domain.to_owned(),
                    held_by: holder.site.clone(),
                });
            }
        }

        let record = inner
            .sites
            .get_mut(site)
            .ok_or_else(|| StateError::SiteNotFound(site.to_owned()))?;
        record.custom_domain = domain.map(ToOwned::to_owned);
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn get_site(&self, site: &str) -> StateResult<Option<SiteRecord>> {
        let inner = self.lock()?;
        Ok(inner.sites.get(site).cloned())
    }

    async fn list_sites(&self) -> StateResult<Vec<SiteRecord>> {
        let inner = self.lock()?;
        let mut sites: Vec<_> = inner.sites.values().cloned().collect();
        sites.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sites)
    }

    async fn get_job(&self, id: &str) -> StateResult<Option<JobRecord>> {
        let inner = self.lock()?;
        Ok(inner.jobs.get(id).cloned())
    }

    async fn hard_delete_site(&self, site: &str) -> StateResult<()> {
        let mut inner = self.lock()?;

        let status = inner
            .sites
            .get(site)
            .ok_or_else(|| StateError::SiteNotFound(site.to_owned()))?
            .status;

        if status != SiteStatus::Destroyed {
            return Err(StateError::conflict(
                "site must be DESTROYED before hard delete",
            ));
        }

        inner.sites.remove(site);
        inner.jobs.retain(|_, j| j.site != site);
        let remaining: Vec<_> = inner.jobs.keys().cloned().collect();
        inner.job_order.retain(|id| remaining.contains(id));
        Ok(())
    }

    async fn hard_delete_job(&self, id: &str) -> StateResult<()> {
        let mut inner = self.lock()?;

        let status = inner
            .jobs
            .get(id)
            .ok_or_else(|| StateError::JobNotFound(id.to_owned()))?
            .status;

        if status.is_active() {
            return Err(StateError::conflict("cannot delete active job"));
        }

        inner.jobs.remove(id);
        inner.job_order.retain(|j| j != id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn claim_follows_creation_order() {
        let store = MemoryStore::new();

        store
            .insert_job("first", JobKind::Provision, "a")
            .await
            .unwrap();
        store
            .insert_job("second", JobKind::Provision, "b")
            .await
            .unwrap();

        let job = store.claim_next_job().await.unwrap().unwrap();
        assert_eq!(job.id, "first");
        assert_eq!(job.attempts, 1);
        assert_eq!(job.status, JobStatus::Processing);
        assert!(job.started_at.is_some());

        let job = store.claim_next_job().await.unwrap().unwrap();
        assert_eq!(job.id, "second");

        assert!(store.claim_next_job().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_skips_exhausted_jobs() {
        let store = MemoryStore::new();
        store
            .insert_job("job", JobKind::Provision, "a")
            .await
            .unwrap();

        for _ in 0..3 {
            let job = store.claim_next_job().await.unwrap().unwrap();
            store.retry_job(&job.id, "boom").await.unwrap();
        }

        // Three attempts consumed; the job is no longer claimable.
        assert!(store.claim_next_job().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retry_preserves_attempts() {
        let store = MemoryStore::new();
        store
            .insert_job("job", JobKind::Provision, "a")
            .await
            .unwrap();

        let job = store.claim_next_job().await.unwrap().unwrap();
        assert_eq!(job.attempts, 1);
        store.retry_job(&job.id, "transient").await.unwrap();

        let job = store.get_job("job").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.error.as_deref(), Some("attempt failed: transient"));

        let job = store.claim_next_job().await.unwrap().unwrap();
        assert_eq!(job.attempts, 2);
    }

    #[tokio::test]
    async fn complete_transitions_site() {
        let store = MemoryStore::new();
        store
            .insert_job("job", JobKind::Provision, "mysite")
            .await
            .unwrap();
        store
            .upsert_site("mysite", "mysite.test", SiteStatus::Provisioning, "job")
            .await
            .unwrap();

        let job = store.claim_next_job().await.unwrap().unwrap();
        store
            .complete_job(&job.id, &job.site, job.kind)
            .await
            .unwrap();

        let site = store.get_site("mysite").await.unwrap().unwrap();
        assert_eq!(site.status, SiteStatus::Active);
        let job = store.get_job("job").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.error.is_none());
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn fail_leaves_site_status_untouched() {
        let store = MemoryStore::new();
        store
            .insert_job("job", JobKind::Provision, "mysite")
            .await
            .unwrap();
        store
            .upsert_site("mysite", "mysite.test", SiteStatus::Provisioning, "job")
            .await
            .unwrap();

        store.claim_next_job().await.unwrap().unwrap();
        store.fail_job("job", "mysite", "gave up").await.unwrap();

        let site = store.get_site("mysite").await.unwrap().unwrap();
        assert_eq!(site.status, SiteStatus::Provisioning);
        let job = store.get_job("job").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("gave up"));
    }

    #[tokio::test]
    async fn upsert_enforces_transitions_on_existing_rows() {
        let store = MemoryStore::new();
        store
            .upsert_site("s", "s.test", SiteStatus::Provisioning, "j1")
            .await
            .unwrap();

        // Same status: job id update is fine.
        store
            .upsert_site("s", "s.test", SiteStatus::Provisioning, "j2")
            .await
            .unwrap();

        // PROVISIONING -> DESTROYED is not a legal edge.
        let err = store
            .upsert_site("s", "s.test", SiteStatus::Destroyed, "j3")
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn transition_rejects_illegal_edges() {
        let store = MemoryStore::new();
        store
            .upsert_site("s", "s.test", SiteStatus::Active, "")
            .await
            .unwrap();

        assert!(store
            .transition_site("s", SiteStatus::Destroying)
            .await
            .is_ok());
        let err = store
            .transition_site("s", SiteStatus::Active)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StateError::InvalidTransition {
                from: SiteStatus::Destroying,
                to: SiteStatus::Active
            }
        ));
    }

    #[tokio::test]
    async fn domain_uniqueness_across_live_sites() {
        let store = MemoryStore::new();
        store
            .upsert_site("a", "a.test", SiteStatus::Active, "")
            .await
            .unwrap();
        store
            .upsert_site("b", "b.test", SiteStatus::Active, "")
            .await
            .unwrap();

        store
            .set_custom_domain("a", Some("example.com"))
            .await
            .unwrap();

        let err = store
            .ensure_domain_available("example.com", "b")
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::DomainTaken { .. }));

        // The holder itself passes the check (idempotent re-attach).
        store
            .ensure_domain_available("example.com", "a")
            .await
            .unwrap();

        // Freed after the holder is destroyed.
        store.transition_site("a", SiteStatus::Destroying).await.unwrap();
        store.transition_site("a", SiteStatus::Destroyed).await.unwrap();
        store
            .ensure_domain_available("example.com", "b")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn recover_stuck_jobs_is_idempotent() {
        let store = MemoryStore::new();
        store
            .insert_job("stuck", JobKind::Provision, "a")
            .await
            .unwrap();
        store.claim_next_job().await.unwrap().unwrap();

        // Backdate the processing start past the timeout.
        store.backdate_started_at("stuck", chrono::Duration::minutes(20));

        let recovered = store
            .recover_stuck_jobs(Duration::from_secs(600))
            .await
            .unwrap();
        assert_eq!(recovered, 1);

        let job = store.get_job("stuck").await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(
            job.error.as_deref(),
            Some("recovered: was stuck in PROCESSING")
        );

        let recovered = store
            .recover_stuck_jobs(Duration::from_secs(600))
            .await
            .unwrap();
        assert_eq!(recovered, 0);
    }

    #[tokio::test]
    async fn fresh_processing_jobs_are_not_recovered() {
        let store = MemoryStore::new();
        store
            .insert_job("live", JobKind::Provision, "a")
            .await
            .unwrap();
        store.claim_next_job().await.unwrap().unwrap();

        let recovered = store
            .recover_stuck_jobs(Duration::from_secs(600))
            .await
            .unwrap();
        assert_eq!(recovered, 0);
    }

    #[tokio::test]
    async fn has_active_job_tracks_queue_state() {
        let store = MemoryStore::new();
        store
            .insert_job("j", JobKind::Provision, "a")
            .await
            .unwrap();
        assert!(store.has_active_job("a").await.unwrap());
        assert!(!store.has_active_job("b").await.unwrap());

        store.claim_next_job().await.unwrap().unwrap();
        assert!(store.has_active_job("a").await.unwrap());

        store.fail_job("j", "a", "done").await.unwrap();
        assert!(!store.has_active_job("a").await.unwrap());
    }

    #[tokio::test]
    async fn hard_delete_site_requires_destroyed() {
        let store = MemoryStore::new();
        store
            .upsert_site("s", "s.test", SiteStatus::Active, "")
            .await
            .unwrap();

        let err = store.hard_delete_site("s").await.unwrap_err();
        assert!(matches!(err, StateError::Conflict(_)));

        store.transition_site("s", SiteStatus::Destroying).await.unwrap();
        store.transition_site("s", SiteStatus::Destroyed).await.unwrap();
        store.hard_delete_site("s").await.unwrap();
        assert!(store.get_site("s").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn hard_delete_job_rejects_active() {
        let store = MemoryStore::new();
        store
            .insert_job("j", JobKind::Provision, "a")
            .await
            .unwrap();

        let err = store.hard_delete_job("j").await.unwrap_err();
        assert!(matches!(err, StateError::Conflict(_)));

        store.claim_next_job().await.unwrap().unwrap();
        store.fail_job("j", "a", "x").await.unwrap();
        store.hard_delete_job("j").await.unwrap();
        assert!(store.get_job("j").await.unwrap().is_none());
    }
}
