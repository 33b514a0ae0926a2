//! The static-site provisioning transaction.
//!
//! Static sites live in a subdirectory of the shared static volume and
//! are served by the edge router's file server directly; no per-site
//! container survives the job. The staged upload is extracted into the
//! volume through an ephemeral helper container that is removed on every
//! path.

use std::path::Path;
use std::sync::Arc;

use tracing::{error, info, warn};

use webfleet_core::naming;
use webfleet_infra::{ArchiveOps, ContainerOps, EdgeConfigOps};

use crate::config::WebfleetConfig;
use crate::error::{ControlError, ControlResult};
use crate::render;

use super::{exec_ok, with_scratch_container};

/// Mount point of the shared static volume inside helper containers and
/// the edge.
const STATIC_MOUNT: &str = "/srv/sites";

#[derive(Debug, Default)]
struct Progress {
    files_uploaded: bool,
    snippet_written: bool,
}

/// Provisions a static site from a staged zip archive.
pub struct StaticProvisioner {
    containers: Arc<dyn ContainerOps>,
    edge: Arc<dyn EdgeConfigOps>,
    archive: Arc<dyn ArchiveOps>,
    cfg: WebfleetConfig,
}

impl StaticProvisioner {
    /// Create a static provisioner over the given adapters.
    pub fn new(
        containers: Arc<dyn ContainerOps>,
        edge: Arc<dyn EdgeConfigOps>,
        archive: Arc<dyn ArchiveOps>,
        cfg: WebfleetConfig,
    ) -> Self {
        Self {
            containers,
            edge,
            archive,
            cfg,
        }
    }

    /// Run the static-provisioning transaction for a site whose upload
    /// was staged at `staged_zip`.
    pub async fn run(&self, site: &str, staged_zip: &Path) -> ControlResult<()> {
        let mut progress = Progress::default();

        match self.forward(site, staged_zip, &mut progress).await {
            Ok(()) => {
                // The staged upload is only consumed on success; a retry
                // of a failed job needs it again.
                if let Err(e) = tokio::fs::remove_file(staged_zip).await {
                    warn!(
                        site = %site,
                        path = %staged_zip.display(),
                        error = %e,
                        "failed to delete staged archive"
                    );
                }
                info!(site = %site, "static site provisioned");
                Ok(())
            }
            Err(reason) => {
                error!(site = %site, error = %reason, "static provisioning failed, rolling back");
                self.rollback(site, &progress).await;
                Err(ControlError::RolledBack {
                    operation: "static provisioning",
                    reason: reason.to_string(),
                })
            }
        }
    }

    async fn forward(
        &self,
        site: &str,
        staged_zip: &Path,
        progress: &mut Progress,
    ) -> ControlResult<()> {
        let domain = naming::site_domain(site, &self.cfg.base_domain);
        let subdir = naming::static_subdir(site);

        // Step 1: extract the upload into the shared volume.
        let tar = self.archive.extract_zip(staged_zip).await?;
        let helper = naming::upload_container(&self.cfg.static_volume);
        let containers = Arc::clone(&self.containers);
        let helper_name = helper.clone();
        with_scratch_container(
            &self.containers,
            &helper,
            &self.cfg.static_volume,
            STATIC_MOUNT,
            || async move {
                exec_ok(
                    &containers,
                    &helper_name,
                    &["mkdir", "-p", &subdir],
                    "site dir creation",
                )
                .await?;
                containers.copy_tar(&helper_name, &subdir, tar).await?;
                Ok(())
            },
        )
        .await?;
        progress.files_uploaded = true;

        // Step 2: edge snippet serving the subdirectory as a file server.
        let snippet = render::edge_snippet_static(site, &domain, None);
        self.edge
            .write_snippet(site, snippet.into_bytes().into())
            .await?;
        progress.snippet_written = true;

        // Step 3: edge reload.
        self.edge.reload().await?;

        Ok(())
    }

    async fn rollback(&self, site: &str, progress: &Progress) {
        if progress.snippet_written {
            if let Err(e) = self.edge.remove_snippet(site).await {
                warn!(site = %site, error = %e, "rollback: snippet removal failed");
            }
            if let Err(e) = self.edge.reload().await {
                warn!(site = %site, error = %e, "rollback: edge reload failed");
            }
        }

        if progress.files_uploaded {
            if let Err(e) = self.remove_site_files(site).await {
                warn!(site = %site, error = %e, "rollback: site file removal failed");
            }
        }
    }

    /// Remove the site's subdirectory from the shared volume through an
    /// ephemeral helper container.
    pub(crate) async fn remove_site_files(&self, site: &str) -> ControlResult<()> {
        let subdir = naming::static_subdir(site);
        let helper = naming::upload_container(&self.cfg.static_volume);
        let containers = Arc::clone(&self.containers);
        let helper_name = helper.clone();

        with_scratch_container(
            &self.containers,
            &helper,
            &self.cfg.static_volume,
            STATIC_MOUNT,
            || async move {
                exec_ok(
                    &containers,
                    &helper_name,
                    &["rm", "-rf", &subdir],
                    "site dir removal",
                )
                .await
            },
        )
        .await
    }
}

impl std::fmt::Debug for StaticProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticProvisioner").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use bytes::Bytes;
    use webfleet_infra::mock::{MockArchive, MockContainers, MockEdge};
    use webfleet_infra::ContainerStatus;

    struct Rig {
        containers: Arc<MockContainers>,
        edge: Arc<MockEdge>,
        archive: Arc<MockArchive>,
        provisioner: StaticProvisioner,
        staged: std::path::PathBuf,
        _dir: tempfile::TempDir,
    }

    fn rig() -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let staged = dir.path().join("docs.zip");
        std::fs::write(&staged, b"not inspected by the mock").unwrap();

        let containers = Arc::new(MockContainers::new());
        let edge = Arc::new(MockEdge::new());
        let archive = Arc::new(MockArchive::new());
        archive.stage(&staged, Bytes::from_static(b"tar-bytes"));

        let provisioner = StaticProvisioner::new(
            Arc::clone(&containers) as Arc<dyn ContainerOps>,
            Arc::clone(&edge) as Arc<dyn EdgeConfigOps>,
            Arc::clone(&archive) as Arc<dyn ArchiveOps>,
            test_config(),
        );

        Rig {
            containers,
            edge,
            archive,
            provisioner,
            staged,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn happy_path_uploads_and_routes() {
        let rig = rig();

        rig.provisioner.run("docs", &rig.staged).await.unwrap();

        // Files landed in the site's subdirectory via the helper.
        let helper = "tmp_upload_static_sites";
        let copies = rig.containers.copies_to(helper);
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].0, "/srv/sites/docs");
        assert_eq!(copies[0].1, Bytes::from_static(b"tar-bytes"));

        // The helper did not outlive the job.
        assert_eq!(
            rig.containers.inspect_status(helper).await.unwrap(),
            ContainerStatus::Missing
        );

        let snippet = rig.edge.snippet("docs").unwrap();
        assert!(snippet.contains("root * /srv/sites/docs"));
        assert_eq!(rig.edge.reloads(), 1);

        // The staged upload was consumed.
        assert!(!rig.staged.exists());
    }

    #[tokio::test]
    async fn reload_failure_rolls_back_files_and_snippet() {
        let rig = rig();
        rig.edge.fail_once("reload");

        let err = rig.provisioner.run("docs", &rig.staged).await.unwrap_err();
        assert!(err
            .to_string()
            .contains("static provisioning failed (rolled back)"));

        assert!(rig.edge.snippet("docs").is_none());

        // The rollback helper scrubbed the subdirectory.
        let execs = rig.containers.execs_in("tmp_upload_static_sites");
        assert!(execs.iter().any(|cmd| cmd[0] == "rm" && cmd[2] == "/srv/sites/docs"));

        // The staged upload survives for the retry.
        assert!(rig.staged.exists());
    }

    #[tokio::test]
    async fn extraction_failure_triggers_no_compensation() {
        let rig = rig();
        rig.archive.fail_once("extract_zip");

        rig.provisioner.run("docs", &rig.staged).await.unwrap_err();

        assert!(rig.edge.snippet("docs").is_none());
        assert_eq!(rig.edge.reloads(), 0);
        let execs = rig.containers.execs_in("tmp_upload_static_sites");
        assert!(execs.is_empty());
    }

    #[tokio::test]
    async fn copy_failure_removes_the_helper() {
        let rig = rig();
        rig.containers.fail_once("copy_tar");

        rig.provisioner.run("docs", &rig.staged).await.unwrap_err();

        assert_eq!(
            rig.containers
                .inspect_status("tmp_upload_static_sites")
                .await
                .unwrap(),
            ContainerStatus::Missing
        );
    }
}
