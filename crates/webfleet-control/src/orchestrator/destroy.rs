//! The site destruction pipeline.
//!
//! Destruction is eventually idempotent rather than transactional: every
//! step tolerates the already-absent condition, partial failure is not
//! compensated, and a previously-failed destroy is simply re-driven by
//! the next attempt of the same job.

use std::sync::Arc;

use tracing::info;

use webfleet_core::naming;
use webfleet_infra::{tolerate_missing, AppDbOps, ContainerOps, EdgeConfigOps};

use crate::config::WebfleetConfig;
use crate::error::ControlResult;

use super::{exec_ok, with_scratch_container, SiteKind, STOP_TIMEOUT};

const STATIC_MOUNT: &str = "/srv/sites";

/// Tears down the complete runtime of a site.
pub struct Destroyer {
    containers: Arc<dyn ContainerOps>,
    edge: Arc<dyn EdgeConfigOps>,
    app_db: Arc<dyn AppDbOps>,
    cfg: WebfleetConfig,
}

impl Destroyer {
    /// Create a destroyer over the given adapters.
    pub fn new(
        containers: Arc<dyn ContainerOps>,
        edge: Arc<dyn EdgeConfigOps>,
        app_db: Arc<dyn AppDbOps>,
        cfg: WebfleetConfig,
    ) -> Self {
        Self {
            containers,
            edge,
            app_db,
            cfg,
        }
    }

    /// Run the destruction pipeline for a site.
    pub async fn run(&self, site: &str, kind: SiteKind) -> ControlResult<()> {
        match kind {
            SiteKind::WordPress => self.destroy_wordpress(site).await?,
            SiteKind::Static => self.destroy_static(site).await?,
        }
        info!(site = %site, "site destroyed");
        Ok(())
    }

    async fn destroy_wordpress(&self, site: &str) -> ControlResult<()> {
        self.remove_container(&naming::sidecar_container(site)).await?;
        self.remove_container(&naming::app_container(site)).await?;

        tolerate_missing(
            self.containers
                .volume_remove(&naming::volume(site), true)
                .await,
        )?;

        self.edge.remove_snippet(site).await?;
        self.edge.reload().await?;

        self.app_db
            .drop_database_and_user(
                &naming::app_database(site),
                &naming::app_db_user(site),
                &self.cfg.app_server_ip,
            )
            .await?;

        Ok(())
    }

    async fn destroy_static(&self, site: &str) -> ControlResult<()> {
        self.remove_static_files(site).await?;
        self.edge.remove_snippet(site).await?;
        self.edge.reload().await?;
        Ok(())
    }

    /// Stop and remove a container, treating "not found" as done.
    async fn remove_container(&self, name: &str) -> ControlResult<()> {
        tolerate_missing(self.containers.stop(name, STOP_TIMEOUT).await)?;
        tolerate_missing(self.containers.remove(name, true).await)?;
        Ok(())
    }

    /// Scrub the site's subdirectory from the shared static volume.
    async fn remove_static_files(&self, site: &str) -> ControlResult<()> {
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

impl std::fmt::Debug for Destroyer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Destroyer").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::orchestrator::Provisioner;
    use webfleet_infra::mock::{MockAppDb, MockContainers, MockEdge};

    struct Rig {
        containers: Arc<MockContainers>,
        edge: Arc<MockEdge>,
        app_db: Arc<MockAppDb>,
        provisioner: Provisioner,
        destroyer: Destroyer,
    }

    fn rig() -> Rig {
        let containers = Arc::new(MockContainers::new());
        let edge = Arc::new(MockEdge::new());
        let app_db = Arc::new(MockAppDb::new());

        let provisioner = Provisioner::new(
            Arc::clone(&containers) as Arc<dyn ContainerOps>,
            Arc::clone(&edge) as Arc<dyn EdgeConfigOps>,
            Arc::clone(&app_db) as Arc<dyn AppDbOps>,
            test_config(),
        );
        let destroyer = Destroyer::new(
            Arc::clone(&containers) as Arc<dyn ContainerOps>,
            Arc::clone(&edge) as Arc<dyn EdgeConfigOps>,
            Arc::clone(&app_db) as Arc<dyn AppDbOps>,
            test_config(),
        );

        Rig {
            containers,
            edge,
            app_db,
            provisioner,
            destroyer,
        }
    }

    #[tokio::test]
    async fn provision_then_destroy_leaves_nothing() {
        let rig = rig();

        rig.provisioner.run("mysite").await.unwrap();
        rig.destroyer
            .run("mysite", SiteKind::WordPress)
            .await
            .unwrap();

        assert!(!rig.containers.container_exists("php_mysite"));
        assert!(!rig.containers.container_exists("nginx_mysite"));
        assert!(!rig.containers.volume_exists("wp_mysite"));
        assert!(rig.edge.snippet("mysite").is_none());
        assert!(!rig.app_db.has_database("wp_mysite"));
    }

    #[tokio::test]
    async fn destroying_an_absent_site_succeeds() {
        let rig = rig();

        // Nothing was ever provisioned; every step tolerates absence.
        rig.destroyer
            .run("ghost", SiteKind::WordPress)
            .await
            .unwrap();
        assert_eq!(rig.edge.reloads(), 1);
    }

    #[tokio::test]
    async fn partial_destroy_can_be_redriven() {
        let rig = rig();
        rig.provisioner.run("mysite").await.unwrap();

        // First attempt dies at the edge reload, after the containers and
        // volume are gone.
        rig.edge.fail_once("reload");
        rig.destroyer
            .run("mysite", SiteKind::WordPress)
            .await
            .unwrap_err();
        assert!(!rig.containers.container_exists("php_mysite"));
        assert!(rig.app_db.has_database("wp_mysite"), "db step never ran");

        // Re-driving the same pipeline completes the teardown.
        rig.destroyer
            .run("mysite", SiteKind::WordPress)
            .await
            .unwrap();
        assert!(!rig.app_db.has_database("wp_mysite"));
    }

    #[tokio::test]
    async fn static_destroy_scrubs_files_and_snippet() {
        let rig = rig();

        rig.destroyer.run("docs", SiteKind::Static).await.unwrap();

        let execs = rig.containers.execs_in("tmp_upload_static_sites");
        assert!(execs
            .iter()
            .any(|cmd| cmd[0] == "rm" && cmd[2] == "/srv/sites/docs"));
        assert!(rig.edge.snippet("docs").is_none());
    }
}
