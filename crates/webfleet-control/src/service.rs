//! Request validation and job enqueueing.
//!
//! `SiteService` sits between the HTTP handlers and the state store: it
//! validates inputs, applies the active-job and lifecycle guards, writes
//! the job and site rows, and enriches site reads with live probes. It
//! never touches infrastructure directly except through the read-only
//! probe surface.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use webfleet_core::{lifecycle, naming, SiteStatus};
use webfleet_infra::EdgeConfigOps;
use webfleet_state::{JobKind, JobRecord, SiteRecord, StateStore};

use crate::config::WebfleetConfig;
use crate::error::{ControlError, ControlResult};
use crate::probes::{probe_site, SiteProbes};

/// Payload marker on a destroy job whose site was static-provisioned.
///
/// `sites.job_id` always points at the latest job, so by the time the
/// worker runs a destroy the provisioning job is no longer reachable from
/// the site row; the shape travels with the destroy job instead.
pub const STATIC_SITE_PAYLOAD: &str = "static";

/// A freshly enqueued job, as reported back to the caller.
#[derive(Debug, Clone)]
pub struct EnqueuedJob {
    pub job_id: String,
    pub site: String,
    pub domain: String,
}

/// A site read enriched with live infrastructure probes.
#[derive(Debug, Clone)]
pub struct SiteDetail {
    pub record: SiteRecord,
    /// Present only while the site should be serving traffic.
    pub probes: Option<SiteProbes>,
}

/// Validates requests and mediates between the API and the state store.
pub struct SiteService {
    store: Arc<dyn StateStore>,
    edge: Arc<dyn EdgeConfigOps>,
    cfg: WebfleetConfig,
}

impl SiteService {
    /// Create a service over the store and the edge probe surface.
    pub fn new(
        store: Arc<dyn StateStore>,
        edge: Arc<dyn EdgeConfigOps>,
        cfg: WebfleetConfig,
    ) -> Self {
        Self { store, edge, cfg }
    }

    /// Queue a WordPress provision for a site.
    pub async fn enqueue_provision(&self, site: &str) -> ControlResult<EnqueuedJob> {
        let site = normalize_site(site)?;
        self.guard_new_provision(&site).await?;
        self.enqueue(&site, JobKind::Provision, None).await
    }

    /// Queue a static provision; `staged_zip` is where the upload was
    /// saved and travels with the job as its payload.
    pub async fn enqueue_static_provision(
        &self,
        site: &str,
        staged_zip: &str,
    ) -> ControlResult<EnqueuedJob> {
        let site = normalize_site(site)?;
        self.guard_new_provision(&site).await?;
        self.enqueue(&site, JobKind::StaticProvision, Some(staged_zip))
            .await
    }

    /// Queue destruction of a site.
    pub async fn enqueue_destroy(&self, site: &str) -> ControlResult<EnqueuedJob> {
        let site = normalize_site(site)?;

        let existing = self
            .store
            .get_site(&site)
            .await?
            .ok_or_else(|| ControlError::not_found("site not found"))?;

        if matches!(
            existing.status,
            SiteStatus::Destroying | SiteStatus::Destroyed
        ) {
            return Err(ControlError::conflict(
                "site is already being destroyed or is destroyed",
            ));
        }

        if self.store.has_active_job(&site).await? {
            return Err(ControlError::conflict(
                "site already has a pending or processing job",
            ));
        }

        // Record the runtime shape before the destroy job takes over the
        // site's job pointer.
        let was_static = match self.store.get_job(&existing.job_id).await? {
            Some(job) => job.kind == JobKind::StaticProvision,
            None => false,
        };

        let job_id = Uuid::new_v4().to_string();
        self.store
            .insert_job(&job_id, JobKind::Destroy, &site)
            .await?;
        if was_static {
            self.store
                .set_job_payload(&job_id, STATIC_SITE_PAYLOAD)
                .await?;
        }
        // The transition check inside the upsert is what rejects destroys
        // from states that do not allow them.
        self.store
            .upsert_site(&site, &existing.domain, SiteStatus::Destroying, &job_id)
            .await?;

        info!(site = %site, job = %job_id, "destroy queued");
        Ok(EnqueuedJob {
            job_id,
            site,
            domain: existing.domain,
        })
    }

    /// Stored state plus live probes when the site should be serving.
    pub async fn get_site(&self, site: &str) -> ControlResult<SiteDetail> {
        let record = self
            .store
            .get_site(site)
            .await?
            .ok_or_else(|| ControlError::not_found("site not found"))?;

        let probes = if matches!(
            record.status,
            SiteStatus::Active | SiteStatus::DomainActive
        ) {
            Some(probe_site(&self.edge, site, record.active_domain()).await)
        } else {
            None
        };

        Ok(SiteDetail { record, probes })
    }

    /// All site rows, newest first.
    pub async fn list_sites(&self) -> ControlResult<Vec<SiteRecord>> {
        Ok(self.store.list_sites().await?)
    }

    /// Fetch a job row.
    pub async fn get_job(&self, id: &str) -> ControlResult<JobRecord> {
        self.store
            .get_job(id)
            .await?
            .ok_or_else(|| ControlError::not_found("job not found"))
    }

    /// Physically remove a destroyed site row and its jobs.
    pub async fn hard_delete_site(&self, site: &str) -> ControlResult<()> {
        Ok(self.store.hard_delete_site(site).await?)
    }

    /// Physically remove a finished job row.
    pub async fn hard_delete_job(&self, id: &str) -> ControlResult<()> {
        Ok(self.store.hard_delete_job(id).await?)
    }

    /// Shared guards for both provision flavors.
    async fn guard_new_provision(&self, site: &str) -> ControlResult<()> {
        if self.store.has_active_job(site).await? {
            return Err(ControlError::conflict(
                "site already has a pending or processing job",
            ));
        }

        if let Some(existing) = self.store.get_site(site).await? {
            if existing.status == SiteStatus::Active {
                return Err(ControlError::conflict(
                    "site already exists and is active",
                ));
            }
        }

        Ok(())
    }

    async fn enqueue(
        &self,
        site: &str,
        kind: JobKind,
        payload: Option<&str>,
    ) -> ControlResult<EnqueuedJob> {
        let job_id = Uuid::new_v4().to_string();
        let domain = naming::site_domain(site, &self.cfg.base_domain);

        self.store.insert_job(&job_id, kind, site).await?;
        self.store
            .upsert_site(site, &domain, SiteStatus::Provisioning, &job_id)
            .await?;

        if let Some(payload) = payload {
            self.store.set_job_payload(&job_id, payload).await?;
        }

        info!(site = %site, job = %job_id, kind = %kind, "job queued");
        Ok(EnqueuedJob {
            job_id,
            site: site.to_owned(),
            domain,
        })
    }
}

fn normalize_site(site: &str) -> ControlResult<String> {
    let site = site.trim().to_lowercase();
    lifecycle::validate_site_name(&site)?;
    Ok(site)
}

impl std::fmt::Debug for SiteService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SiteService").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use webfleet_infra::mock::MockEdge;
    use webfleet_state::{JobStatus, MemoryStore, StateError};

    struct Rig {
        store: Arc<MemoryStore>,
        edge: Arc<MockEdge>,
        service: SiteService,
    }

    fn rig() -> Rig {
        let store = Arc::new(MemoryStore::new());
        let edge = Arc::new(MockEdge::new());
        let service = SiteService::new(
            Arc::clone(&store) as Arc<dyn StateStore>,
            Arc::clone(&edge) as Arc<dyn EdgeConfigOps>,
            test_config(),
        );
        Rig {
            store,
            edge,
            service,
        }
    }

    #[tokio::test]
    async fn provision_creates_job_and_site_rows() {
        let rig = rig();

        let enqueued = rig.service.enqueue_provision("MySite").await.unwrap();
        assert_eq!(enqueued.site, "mysite");
        assert_eq!(enqueued.domain, "mysite.hosto.com");

        let job = rig.store.get_job(&enqueued.job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);

        let site = rig.store.get_site("mysite").await.unwrap().unwrap();
        assert_eq!(site.status, SiteStatus::Provisioning);
        assert_eq!(site.job_id, enqueued.job_id);
    }

    #[tokio::test]
    async fn invalid_names_are_rejected() {
        let rig = rig();
        for bad in ["", "My Site", "my-site", "my.site", "UPPER!"] {
            let err = rig.service.enqueue_provision(bad).await.unwrap_err();
            assert!(matches!(err, ControlError::Validation(_)), "{bad:?}");
        }
    }

    #[tokio::test]
    async fn active_job_blocks_a_second_enqueue() {
        let rig = rig();
        rig.service.enqueue_provision("mysite").await.unwrap();

        let err = rig.service.enqueue_provision("mysite").await.unwrap_err();
        assert!(matches!(err, ControlError::Conflict(_)));
    }

    #[tokio::test]
    async fn active_site_blocks_reprovision() {
        let rig = rig();
        let enqueued = rig.service.enqueue_provision("mysite").await.unwrap();

        // Simulate the worker finishing the job.
        rig.store.claim_next_job().await.unwrap().unwrap();
        rig.store
            .complete_job(&enqueued.job_id, "mysite", JobKind::Provision)
            .await
            .unwrap();

        let err = rig.service.enqueue_provision("mysite").await.unwrap_err();
        assert!(err.to_string().contains("active"));
    }

    #[tokio::test]
    async fn static_provision_carries_the_staged_path() {
        let rig = rig();

        let enqueued = rig
            .service
            .enqueue_static_provision("docs", "/tmp/staging/docs.zip")
            .await
            .unwrap();

        let job = rig.store.get_job(&enqueued.job_id).await.unwrap().unwrap();
        assert_eq!(job.kind, JobKind::StaticProvision);
        assert_eq!(job.payload.as_deref(), Some("/tmp/staging/docs.zip"));
    }

    #[tokio::test]
    async fn destroy_requires_an_existing_destroyable_site() {
        let rig = rig();

        let err = rig.service.enqueue_destroy("ghost").await.unwrap_err();
        assert!(matches!(err, ControlError::NotFound(_)));

        // A site mid-provision cannot be destroyed: the lifecycle does
        // not allow PROVISIONING -> DESTROYING.
        rig.service.enqueue_provision("mysite").await.unwrap();
        rig.store.claim_next_job().await.unwrap().unwrap();
        let err = rig.service.enqueue_destroy("mysite").await.unwrap_err();
        assert!(matches!(err, ControlError::Conflict(_)));
    }

    #[tokio::test]
    async fn destroy_of_an_active_site_queues() {
        let rig = rig();
        let enqueued = rig.service.enqueue_provision("mysite").await.unwrap();
        rig.store.claim_next_job().await.unwrap().unwrap();
        rig.store
            .complete_job(&enqueued.job_id, "mysite", JobKind::Provision)
            .await
            .unwrap();

        rig.service.enqueue_destroy("mysite").await.unwrap();

        let site = rig.store.get_site("mysite").await.unwrap().unwrap();
        assert_eq!(site.status, SiteStatus::Destroying);

        let err = rig.service.enqueue_destroy("mysite").await.unwrap_err();
        assert!(err.to_string().contains("already being destroyed"));
    }

    #[tokio::test]
    async fn destroy_of_a_static_site_marks_the_job() {
        let rig = rig();
        let enqueued = rig
            .service
            .enqueue_static_provision("docs", "/tmp/staging/docs.zip")
            .await
            .unwrap();
        rig.store.claim_next_job().await.unwrap().unwrap();
        rig.store
            .complete_job(&enqueued.job_id, "docs", JobKind::StaticProvision)
            .await
            .unwrap();

        let destroy = rig.service.enqueue_destroy("docs").await.unwrap();

        let job = rig.store.get_job(&destroy.job_id).await.unwrap().unwrap();
        assert_eq!(job.payload.as_deref(), Some(STATIC_SITE_PAYLOAD));
    }

    #[tokio::test]
    async fn get_site_probes_only_serving_states() {
        let rig = rig();
        let enqueued = rig.service.enqueue_provision("mysite").await.unwrap();

        // PROVISIONING: no probes.
        let detail = rig.service.get_site("mysite").await.unwrap();
        assert!(detail.probes.is_none());

        rig.store.claim_next_job().await.unwrap().unwrap();
        rig.store
            .complete_job(&enqueued.job_id, "mysite", JobKind::Provision)
            .await
            .unwrap();
        rig.edge
            .write_snippet("mysite", bytes::Bytes::from_static(b"mysite.hosto.com {}"))
            .await
            .unwrap();
        rig.edge.issue_cert("mysite.hosto.com");

        let detail = rig.service.get_site("mysite").await.unwrap();
        let probes = detail.probes.unwrap();
        assert!(probes.warnings.is_empty());
    }

    #[tokio::test]
    async fn hard_deletes_delegate_their_guards_to_the_store() {
        let rig = rig();
        rig.service.enqueue_provision("mysite").await.unwrap();

        let err = rig.service.hard_delete_site("mysite").await.unwrap_err();
        assert!(matches!(err, ControlError::State(StateError::Conflict(_))));
    }
}
