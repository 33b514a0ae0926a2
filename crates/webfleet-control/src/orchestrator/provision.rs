//! The WordPress-site provisioning transaction.

use std::sync::Arc;

use tracing::{error, info, warn};

use webfleet_core::naming;
use webfleet_infra::{tar_single_file, AppDbOps, ContainerOps, ContainerSpec, EdgeConfigOps};

use crate::config::WebfleetConfig;
use crate::error::{ControlError, ControlResult};
use crate::render;

use super::{exec_ok, STOP_TIMEOUT};

const APP_IMAGE: &str = "wordpress:php8.2-fpm";
const SIDECAR_IMAGE: &str = "nginx:stable";
const APP_MOUNT: &str = "/var/www/html";
const SIDECAR_CONF_DIR: &str = "/etc/nginx/conf.d";
const SIDECAR_CONF_FILE: &str = "default.conf";

const APP_MEMORY: i64 = 512 * 1024 * 1024;
const APP_NANO_CPUS: i64 = 1_000_000_000;
const APP_PIDS: i64 = 100;
const SIDECAR_MEMORY: i64 = 128 * 1024 * 1024;
const SIDECAR_NANO_CPUS: i64 = 500_000_000;
const SIDECAR_PIDS: i64 = 50;

/// Steps that completed and therefore need compensation on failure.
#[derive(Debug, Default)]
struct Progress {
    db_created: bool,
    vol_created: bool,
    app_created: bool,
    sidecar_created: bool,
    snippet_written: bool,
}

/// Provisions the full runtime for a WordPress site.
///
/// Seven forward steps: application database + user, shared volume,
/// application container, sidecar container, sidecar server block, edge
/// snippet, edge reload. On any failure the completed steps are undone in
/// reverse order and the job error carries a rolled-back tag. Every step
/// is idempotent, so a retried job re-runs from the top safely.
pub struct Provisioner {
    containers: Arc<dyn ContainerOps>,
    edge: Arc<dyn EdgeConfigOps>,
    app_db: Arc<dyn AppDbOps>,
    cfg: WebfleetConfig,
}

impl Provisioner {
    /// Create a provisioner over the given adapters.
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

    /// Run the provisioning transaction for a site.
    pub async fn run(&self, site: &str) -> ControlResult<()> {
        let mut progress = Progress::default();

        match self.forward(site, &mut progress).await {
            Ok(()) => {
                info!(site = %site, "site provisioned");
                Ok(())
            }
            Err(reason) => {
                error!(site = %site, error = %reason, "provisioning failed, rolling back");
                self.rollback(site, &progress).await;
                Err(ControlError::RolledBack {
                    operation: "provisioning",
                    reason: reason.to_string(),
                })
            }
        }
    }

    async fn forward(&self, site: &str, progress: &mut Progress) -> ControlResult<()> {
        let db = naming::app_database(site);
        let user = naming::app_db_user(site);
        let password = naming::app_db_password(site);
        let volume = naming::volume(site);
        let sidecar = naming::sidecar_container(site);
        let domain = naming::site_domain(site, &self.cfg.base_domain);

        // Step 1: application database and user.
        self.app_db
            .create_database_and_user(&db, &user, &password, &self.cfg.app_server_ip)
            .await?;
        progress.db_created = true;

        // Step 2: shared volume.
        self.containers.volume_create(&volume).await?;
        progress.vol_created = true;

        // Step 3: application container.
        self.containers.create_app(&self.app_spec(site)).await?;
        progress.app_created = true;

        // Step 4: sidecar container, read-only mount of the same volume.
        self.containers
            .create_sidecar(&self.sidecar_spec(site))
            .await?;
        progress.sidecar_created = true;

        // Step 5: sidecar server block, then a live reload inside it.
        let block = render::sidecar_server_block(site, &domain, None);
        let archive = tar_single_file(SIDECAR_CONF_FILE, block.as_bytes(), 0o644)?;
        self.containers
            .copy_tar(&sidecar, SIDECAR_CONF_DIR, archive)
            .await?;
        exec_ok(
            &self.containers,
            &sidecar,
            &["nginx", "-s", "reload"],
            "sidecar reload",
        )
        .await?;

        // Step 6: edge snippet.
        let snippet = render::edge_snippet_wordpress(site, &domain, None);
        self.edge
            .write_snippet(site, snippet.into_bytes().into())
            .await?;
        progress.snippet_written = true;

        // Step 7: edge reload, which picks up the new snippet.
        self.edge.reload().await?;

        Ok(())
    }

    fn app_spec(&self, site: &str) -> ContainerSpec {
        ContainerSpec {
            name: naming::app_container(site),
            image: APP_IMAGE.to_owned(),
            env: vec![
                format!("WORDPRESS_DB_HOST={}", self.cfg.app_db_host()),
                format!("WORDPRESS_DB_USER={}", naming::app_db_user(site)),
                format!("WORDPRESS_DB_PASSWORD={}", naming::app_db_password(site)),
                format!("WORDPRESS_DB_NAME={}", naming::app_database(site)),
            ],
            volume: naming::volume(site),
            mount_target: APP_MOUNT.to_owned(),
            read_only: false,
            memory_bytes: APP_MEMORY,
            nano_cpus: APP_NANO_CPUS,
            pids_limit: APP_PIDS,
            network: Some(self.cfg.docker_network.clone()),
            cmd: None,
            restart_unless_stopped: true,
        }
    }

    fn sidecar_spec(&self, site: &str) -> ContainerSpec {
        ContainerSpec {
            name: naming::sidecar_container(site),
            image: SIDECAR_IMAGE.to_owned(),
            env: Vec::new(),
            volume: naming::volume(site),
            mount_target: APP_MOUNT.to_owned(),
            read_only: true,
            memory_bytes: SIDECAR_MEMORY,
            nano_cpus: SIDECAR_NANO_CPUS,
            pids_limit: SIDECAR_PIDS,
            network: Some(self.cfg.docker_network.clone()),
            cmd: None,
            restart_unless_stopped: true,
        }
    }

    /// Undo completed steps in reverse order. Errors are logged and
    /// swallowed; the caller reports the original failure.
    async fn rollback(&self, site: &str, progress: &Progress) {
        if progress.snippet_written {
            if let Err(e) = self.edge.remove_snippet(site).await {
                warn!(site = %site, error = %e, "rollback: snippet removal failed");
            }
            if let Err(e) = self.edge.reload().await {
                warn!(site = %site, error = %e, "rollback: edge reload failed");
            }
        }

        if progress.sidecar_created {
            self.tear_down_container(&naming::sidecar_container(site)).await;
        }
        if progress.app_created {
            self.tear_down_container(&naming::app_container(site)).await;
        }

        if progress.vol_created {
            if let Err(e) = self.containers.volume_remove(&naming::volume(site), true).await {
                warn!(site = %site, error = %e, "rollback: volume removal failed");
            }
        }

        if progress.db_created {
            if let Err(e) = self
                .app_db
                .drop_database_and_user(
                    &naming::app_database(site),
                    &naming::app_db_user(site),
                    &self.cfg.app_server_ip,
                )
                .await
            {
                warn!(site = %site, error = %e, "rollback: database drop failed");
            }
        }
    }

    async fn tear_down_container(&self, name: &str) {
        if let Err(e) = self.containers.stop(name, STOP_TIMEOUT).await {
            if !e.is_not_found() {
                warn!(container = %name, error = %e, "rollback: container stop failed");
            }
        }
        if let Err(e) = self.containers.remove(name, true).await {
            if !e.is_not_found() {
                warn!(container = %name, error = %e, "rollback: container removal failed");
            }
        }
    }
}

impl std::fmt::Debug for Provisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provisioner").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use webfleet_infra::mock::{MockAppDb, MockContainers, MockEdge};

    struct Rig {
        containers: Arc<MockContainers>,
        edge: Arc<MockEdge>,
        app_db: Arc<MockAppDb>,
        provisioner: Provisioner,
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
        Rig {
            containers,
            edge,
            app_db,
            provisioner,
        }
    }

    fn assert_nothing_exists(rig: &Rig, site: &str) {
        assert!(!rig.app_db.has_database(&naming::app_database(site)));
        assert!(!rig.containers.volume_exists(&naming::volume(site)));
        assert!(!rig.containers.container_exists(&naming::app_container(site)));
        assert!(!rig
            .containers
            .container_exists(&naming::sidecar_container(site)));
        assert!(rig.edge.snippet(site).is_none());
    }

    #[tokio::test]
    async fn happy_path_creates_everything() {
        let rig = rig();

        rig.provisioner.run("mysite").await.unwrap();

        assert!(rig.app_db.has_database("wp_mysite"));
        assert!(rig.containers.volume_exists("wp_mysite"));
        assert!(rig.containers.container_exists("php_mysite"));
        assert!(rig.containers.container_exists("nginx_mysite"));
        assert_eq!(rig.edge.reloads(), 1);

        let snippet = rig.edge.snippet("mysite").unwrap();
        assert!(snippet.contains("mysite.hosto.com"));
        assert!(snippet.contains("nginx_mysite:80"));

        // Sidecar got its server block and a live reload.
        let copies = rig.containers.copies_to("nginx_mysite");
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].0, SIDECAR_CONF_DIR);
        let execs = rig.containers.execs_in("nginx_mysite");
        assert_eq!(execs, vec![vec!["nginx", "-s", "reload"]]);
    }

    #[tokio::test]
    async fn container_shapes_match_the_contract() {
        let rig = rig();
        rig.provisioner.run("mysite").await.unwrap();

        let app = rig.containers.created_spec("php_mysite").unwrap();
        assert_eq!(app.memory_bytes, 512 * 1024 * 1024);
        assert_eq!(app.nano_cpus, 1_000_000_000);
        assert_eq!(app.pids_limit, 100);
        assert!(!app.read_only);
        assert!(app.restart_unless_stopped);
        assert!(app
            .env
            .iter()
            .any(|e| e == "WORDPRESS_DB_NAME=wp_mysite"));

        let sidecar = rig.containers.created_spec("nginx_mysite").unwrap();
        assert_eq!(sidecar.memory_bytes, 128 * 1024 * 1024);
        assert_eq!(sidecar.nano_cpus, 500_000_000);
        assert_eq!(sidecar.pids_limit, 50);
        assert!(sidecar.read_only);
        assert_eq!(sidecar.volume, app.volume);
    }

    #[tokio::test]
    async fn edge_reload_failure_rolls_back_everything() {
        let rig = rig();
        rig.edge.fail_once("reload");

        let err = rig.provisioner.run("mysite").await.unwrap_err();
        assert!(err.to_string().contains("provisioning failed (rolled back)"));

        assert_nothing_exists(&rig, "mysite");
    }

    #[tokio::test]
    async fn sidecar_failure_rolls_back_earlier_steps() {
        let rig = rig();
        rig.containers.fail_once("create_sidecar");

        rig.provisioner.run("mysite").await.unwrap_err();

        assert_nothing_exists(&rig, "mysite");
    }

    #[tokio::test]
    async fn database_failure_leaves_nothing_behind() {
        let rig = rig();
        rig.app_db.fail_once("create_database_and_user");

        rig.provisioner.run("mysite").await.unwrap_err();

        assert_nothing_exists(&rig, "mysite");
    }

    #[tokio::test]
    async fn retry_after_transient_failure_succeeds() {
        let rig = rig();
        rig.edge.fail_once("reload");

        rig.provisioner.run("mysite").await.unwrap_err();
        rig.provisioner.run("mysite").await.unwrap();

        assert!(rig.containers.container_exists("php_mysite"));
        assert!(rig.edge.snippet("mysite").is_some());
    }

    #[tokio::test]
    async fn rerun_over_existing_resources_is_idempotent() {
        let rig = rig();

        rig.provisioner.run("mysite").await.unwrap();
        rig.provisioner.run("mysite").await.unwrap();

        assert!(rig.containers.container_exists("php_mysite"));
        assert_eq!(rig.edge.reloads(), 2);
    }
}
