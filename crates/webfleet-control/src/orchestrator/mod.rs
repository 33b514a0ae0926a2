//! Multi-step transactions against the external systems.
//!
//! Each orchestrator executes its forward steps in a fixed order with
//! infra-before-DB discipline, tracks which steps completed, and on
//! failure compensates in reverse order. Compensation errors are logged
//! and ignored; the caller receives the original failure, tagged as
//! rolled back. Every forward step is safe to re-execute, so a retried
//! job converges.

mod destroy;
mod domain;
mod provision;
mod static_site;

pub use destroy::Destroyer;
pub use domain::{AttachOutcome, DetachOutcome, DomainManager, DomainStatusReport, DomainStep};
pub use provision::Provisioner;
pub use static_site::StaticProvisioner;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use webfleet_infra::{ContainerOps, ContainerSpec};
use webfleet_state::JobKind;

use crate::error::{ControlError, ControlResult};

/// Which runtime shape a site was provisioned with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteKind {
    /// PHP application container plus static-file sidecar.
    WordPress,
    /// Files in the shared static volume, served by the edge directly.
    Static,
}

impl SiteKind {
    /// Derive the site kind from the job that provisioned it.
    #[must_use]
    pub const fn from_job_kind(kind: JobKind) -> Self {
        match kind {
            JobKind::StaticProvision => Self::Static,
            JobKind::Provision | JobKind::Destroy => Self::WordPress,
        }
    }
}

/// Grace period when stopping site containers during teardown.
pub(crate) const STOP_TIMEOUT: Duration = Duration::from_secs(30);

/// Run a command in a container and require a zero exit code.
pub(crate) async fn exec_ok(
    containers: &Arc<dyn ContainerOps>,
    container: &str,
    cmd: &[&str],
    what: &str,
) -> ControlResult<()> {
    let out = containers.exec(container, cmd).await?;
    if out.success() {
        Ok(())
    } else {
        Err(ControlError::internal(format!(
            "{what} in {container} failed: {}",
            out.output.trim()
        )))
    }
}

/// Run `work` with an ephemeral helper container mounting `volume` at
/// `mount_target`.
///
/// The container is force-removed on every path, success or failure, so a
/// crash between jobs leaves at most one stale helper that the next run's
/// create-or-start absorbs.
pub(crate) async fn with_scratch_container<F, Fut, T>(
    containers: &Arc<dyn ContainerOps>,
    name: &str,
    volume: &str,
    mount_target: &str,
    work: F,
) -> ControlResult<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ControlResult<T>>,
{
    let spec = ContainerSpec::scratch(name, volume, mount_target);
    containers.create_app(&spec).await?;

    let result = work().await;

    if let Err(e) = containers.remove(name, true).await {
        if !e.is_not_found() {
            warn!(container = %name, error = %e, "failed to remove helper container");
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use webfleet_infra::mock::MockContainers;
    use webfleet_infra::ContainerStatus;

    #[test]
    fn site_kind_from_job_kind() {
        assert_eq!(
            SiteKind::from_job_kind(JobKind::Provision),
            SiteKind::WordPress
        );
        assert_eq!(
            SiteKind::from_job_kind(JobKind::StaticProvision),
            SiteKind::Static
        );
        assert_eq!(
            SiteKind::from_job_kind(JobKind::Destroy),
            SiteKind::WordPress
        );
    }

    #[tokio::test]
    async fn scratch_container_is_removed_on_success_and_failure() {
        let containers: Arc<dyn ContainerOps> = Arc::new(MockContainers::new());

        with_scratch_container(&containers, "tmp_upload_x", "vol", "/data", || async {
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(
            containers.inspect_status("tmp_upload_x").await.unwrap(),
            ContainerStatus::Missing
        );

        let result: ControlResult<()> =
            with_scratch_container(&containers, "tmp_upload_x", "vol", "/data", || async {
                Err(ControlError::internal("boom"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(
            containers.inspect_status("tmp_upload_x").await.unwrap(),
            ContainerStatus::Missing
        );
    }
}
