//! The background job worker.
//!
//! A single long-running loop drains the queue: at most one job per tick,
//! claimed atomically from the store, dispatched by kind, and finished as
//! completed, retried, or permanently failed. On startup, jobs left in
//! `PROCESSING` by a crashed process are recovered back to `PENDING`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use webfleet_state::{JobRecord, StateStore};

use crate::error::{ControlError, ControlResult};
use crate::orchestrator::{Destroyer, Provisioner, SiteKind, StaticProvisioner};
use crate::service::STATIC_SITE_PAYLOAD;

/// Single-process polling scheduler for the job queue.
pub struct Worker {
    store: Arc<dyn StateStore>,
    provisioner: Arc<Provisioner>,
    destroyer: Arc<Destroyer>,
    static_provisioner: Arc<StaticProvisioner>,
    poll_interval: Duration,
    stuck_timeout: Duration,
}

impl Worker {
    /// Create a worker over the store and orchestrators.
    pub fn new(
        store: Arc<dyn StateStore>,
        provisioner: Arc<Provisioner>,
        destroyer: Arc<Destroyer>,
        static_provisioner: Arc<StaticProvisioner>,
        poll_interval: Duration,
        stuck_timeout: Duration,
    ) -> Self {
        Self {
            store,
            provisioner,
            destroyer,
            static_provisioner,
            poll_interval,
            stuck_timeout,
        }
    }

    /// Run until cancelled. The current tick always completes; the next
    /// one is simply never started.
    pub async fn run(&self, cancel: CancellationToken) {
        info!("worker starting");

        match self.store.recover_stuck_jobs(self.stuck_timeout).await {
            Ok(0) => {}
            Ok(recovered) => {
                info!(recovered, "recovered stuck jobs back to PENDING");
            }
            Err(e) => warn!(error = %e, "stuck job recovery failed"),
        }

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("worker stopping");
                    return;
                }
                _ = ticker.tick() => self.tick().await,
            }
        }
    }

    /// Claim and process at most one job.
    pub async fn tick(&self) {
        let job = match self.store.claim_next_job().await {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "failed to claim a job");
                return;
            }
        };

        info!(
            job = %job.id,
            kind = %job.kind,
            site = %job.site,
            attempt = job.attempts,
            max_attempts = job.max_attempts,
            "claimed job"
        );

        match self.execute(&job).await {
            Ok(()) => {
                info!(job = %job.id, site = %job.site, "job completed");
                if let Err(e) = self.store.complete_job(&job.id, &job.site, job.kind).await {
                    error!(job = %job.id, error = %e, "failed to mark job complete");
                }
            }
            Err(job_error) => {
                if job.attempts >= job.max_attempts {
                    error!(
                        job = %job.id,
                        site = %job.site,
                        attempts = job.attempts,
                        error = %job_error,
                        "job exhausted all attempts, marking FAILED"
                    );
                    if let Err(e) = self
                        .store
                        .fail_job(&job.id, &job.site, &job_error.to_string())
                        .await
                    {
                        error!(job = %job.id, error = %e, "failed to mark job failed");
                    }
                } else {
                    warn!(
                        job = %job.id,
                        site = %job.site,
                        attempt = job.attempts,
                        remaining = job.max_attempts - job.attempts,
                        error = %job_error,
                        "job attempt failed, scheduling retry"
                    );
                    if let Err(e) = self.store.retry_job(&job.id, &job_error.to_string()).await {
                        error!(job = %job.id, error = %e, "failed to schedule retry");
                    }
                }
            }
        }
    }

    async fn execute(&self, job: &JobRecord) -> ControlResult<()> {
        match job.kind {
            webfleet_state::JobKind::Provision => self.provisioner.run(&job.site).await,
            webfleet_state::JobKind::StaticProvision => {
                let payload = job.payload.as_deref().ok_or_else(|| {
                    ControlError::internal("static provision job has no staged archive")
                })?;
                self.static_provisioner
                    .run(&job.site, Path::new(payload))
                    .await
            }
            webfleet_state::JobKind::Destroy => {
                // The enqueue path stamps the payload with the runtime
                // shape recorded at provision time.
                let kind = if job.payload.as_deref() == Some(STATIC_SITE_PAYLOAD) {
                    SiteKind::Static
                } else {
                    SiteKind::WordPress
                };
                self.destroyer.run(&job.site, kind).await
            }
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("poll_interval", &self.poll_interval)
            .field("stuck_timeout", &self.stuck_timeout)
            .finish_non_exhaustive()
    }
}
