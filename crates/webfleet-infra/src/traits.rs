//! Capability traits the orchestration core depends on.
//!
//! Any implementation satisfying these contracts is acceptable; the core
//! holds them as `Arc<dyn ...>` so tests substitute the in-memory versions
//! from [`crate::mock`].

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::InfraResult;

/// Observed state of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Running,
    Exited,
    Missing,
}

/// Everything needed to create a per-site container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// `KEY=value` environment entries.
    pub env: Vec<String>,
    /// Volume mounted into the container.
    pub volume: String,
    /// Mount point inside the container.
    pub mount_target: String,
    /// Mount the volume read-only.
    pub read_only: bool,
    pub memory_bytes: i64,
    pub nano_cpus: i64,
    pub pids_limit: i64,
    /// Docker network to attach; `None` leaves the default.
    pub network: Option<String>,
    /// Override the image command (ephemeral helper containers).
    pub cmd: Option<Vec<String>>,
    /// Apply the `unless-stopped` restart policy.
    pub restart_unless_stopped: bool,
}

impl ContainerSpec {
    /// Spec for an ephemeral helper container that mounts `volume` at
    /// `mount_target` and sleeps so it can receive copies and execs.
    #[must_use]
    pub fn scratch(name: impl Into<String>, volume: impl Into<String>, mount_target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: "busybox".to_owned(),
            env: Vec::new(),
            volume: volume.into(),
            mount_target: mount_target.into(),
            read_only: false,
            memory_bytes: 64 * 1024 * 1024,
            nano_cpus: 250_000_000,
            pids_limit: 16,
            network: None,
            cmd: Some(vec!["sleep".to_owned(), "300".to_owned()]),
            restart_unless_stopped: false,
        }
    }
}

/// Result of a synchronous in-container command.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i64,
    /// Combined stdout and stderr.
    pub output: String,
}

impl ExecOutput {
    /// Whether the command exited zero.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Container daemon operations.
///
/// All mutating operations are idempotent with respect to "already in the
/// desired state": creating an existing container starts it and reports
/// success, and volume creation is inherently idempotent. Removal of an
/// absent resource surfaces as a distinguishable not-found error that
/// teardown callers tolerate.
#[async_trait]
pub trait ContainerOps: Send + Sync {
    /// Observe whether a container is running, exited, or absent.
    async fn inspect_status(&self, name: &str) -> InfraResult<ContainerStatus>;

    /// Create and start the application container.
    ///
    /// If a container with the spec's name already exists it is simply
    /// started.
    async fn create_app(&self, spec: &ContainerSpec) -> InfraResult<()>;

    /// Create and start a sidecar container (read-only volume mount).
    async fn create_sidecar(&self, spec: &ContainerSpec) -> InfraResult<()>;

    /// Start an existing container.
    async fn start(&self, name: &str) -> InfraResult<()>;

    /// Stop a running container, waiting up to `timeout`.
    async fn stop(&self, name: &str, timeout: Duration) -> InfraResult<()>;

    /// Remove a container.
    async fn remove(&self, name: &str, force: bool) -> InfraResult<()>;

    /// Stream a tar archive into `dest_dir` inside the container.
    async fn copy_tar(&self, container: &str, dest_dir: &str, tar: Bytes) -> InfraResult<()>;

    /// Run a command inside the container and wait for it to finish.
    async fn exec(&self, container: &str, cmd: &[&str]) -> InfraResult<ExecOutput>;

    /// Create a named volume (idempotent).
    async fn volume_create(&self, name: &str) -> InfraResult<()>;

    /// Remove a named volume.
    async fn volume_remove(&self, name: &str, force: bool) -> InfraResult<()>;
}

/// Edge router configuration operations.
///
/// The edge router dispatches hostnames and terminates TLS; per-site
/// snippets live in a directory inside the edge container, and a reload
/// re-reads the whole directory, so overlapping reloads are safe.
#[async_trait]
pub trait EdgeConfigOps: Send + Sync {
    /// Create the snippet directory if it does not exist.
    async fn ensure_snippet_dir(&self) -> InfraResult<()>;

    /// Write (or overwrite) a site's routing snippet.
    async fn write_snippet(&self, site: &str, contents: Bytes) -> InfraResult<()>;

    /// Remove a site's routing snippet; absent snippets are fine.
    async fn remove_snippet(&self, site: &str) -> InfraResult<()>;

    /// Graceful zero-downtime reload with validate-then-apply semantics.
    async fn reload(&self) -> InfraResult<()>;

    /// Whether the site's snippet file exists.
    async fn snippet_exists(&self, site: &str) -> InfraResult<bool>;

    /// Whether the site's snippet mentions `needle` (e.g. a hostname).
    async fn snippet_contains(&self, site: &str, needle: &str) -> InfraResult<bool>;

    /// Whether the edge router has an issued certificate on disk for the
    /// domain. The path convention is deployment-configured.
    async fn cert_on_disk(&self, domain: &str) -> InfraResult<bool>;
}

/// Application-database administration (per-site databases and users).
#[async_trait]
pub trait AppDbOps: Send + Sync {
    /// Create the site database and its user, granted from `from_host`.
    /// Idempotent (`IF NOT EXISTS` throughout).
    async fn create_database_and_user(
        &self,
        db: &str,
        user: &str,
        password: &str,
        from_host: &str,
    ) -> InfraResult<()>;

    /// Drop the site database and its user. Idempotent (`IF EXISTS`).
    async fn drop_database_and_user(
        &self,
        db: &str,
        user: &str,
        from_host: &str,
    ) -> InfraResult<()>;

    /// Point the application's URL records at `url`. Idempotent; callers
    /// treat failures as warnings, never rollback triggers.
    async fn update_site_urls(&self, db: &str, url: &str) -> InfraResult<()>;
}

/// DNS resolution.
#[async_trait]
pub trait DnsResolve: Send + Sync {
    /// Resolve the domain's A records.
    async fn lookup_a(&self, domain: &str) -> InfraResult<Vec<Ipv4Addr>>;
}

/// Archive extraction.
#[async_trait]
pub trait ArchiveOps: Send + Sync {
    /// Read a zip file and return a tar stream of all regular files with
    /// their zip-relative paths, preserving modes.
    async fn extract_zip(&self, path: &Path) -> InfraResult<Bytes>;
}

/// Tunnel ingress-file maintenance.
///
/// Records which hostnames the tunnel serves. The catch-all rule already
/// routes traffic, so these edits never restart the tunnel daemon; DNS
/// route mutation stays outside this system.
#[async_trait]
pub trait TunnelConfigOps: Send + Sync {
    /// Add the hostname to the ingress rules (idempotent).
    async fn ensure_ingress(&self, hostname: &str) -> InfraResult<()>;

    /// Remove the hostname from the ingress rules (idempotent).
    async fn remove_ingress(&self, hostname: &str) -> InfraResult<()>;

    /// Whether the hostname is present in the ingress rules.
    async fn has_ingress(&self, hostname: &str) -> InfraResult<bool>;
}
