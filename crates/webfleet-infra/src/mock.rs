//! In-memory capability implementations for tests.
//!
//! Each mock keeps just enough state to answer the contract's questions
//! and records the calls the orchestrator tests assert on. Failures are
//! scripted per operation name with [`fail_once`], which is how the
//! rollback and retry paths are exercised.
//!
//! [`fail_once`]: MockContainers::fail_once

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{InfraError, InfraResult};
use crate::traits::{
    AppDbOps, ArchiveOps, ContainerOps, ContainerSpec, ContainerStatus, DnsResolve, EdgeConfigOps,
    ExecOutput, TunnelConfigOps,
};

/// Scripted one-shot failures keyed by operation name.
#[derive(Debug, Default)]
struct FailureScript {
    pending: Mutex<Vec<String>>,
}

impl FailureScript {
    fn push(&self, op: &str) {
        self.pending.lock().unwrap().push(op.to_owned());
    }

    /// Consume a scripted failure for `op` if one is pending.
    fn take(&self, op: &str) -> bool {
        let mut pending = self.pending.lock().unwrap();
        if let Some(index) = pending.iter().position(|o| o == op) {
            pending.remove(index);
            true
        } else {
            false
        }
    }

    fn check(&self, subsystem: &'static str, op: &str) -> InfraResult<()> {
        if self.take(op) {
            Err(InfraError::adapter(subsystem, format!("injected {op} failure")))
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone)]
struct MockContainer {
    spec: Option<ContainerSpec>,
    running: bool,
}

/// In-memory [`ContainerOps`].
#[derive(Debug, Default)]
pub struct MockContainers {
    containers: Mutex<HashMap<String, MockContainer>>,
    volumes: Mutex<HashSet<String>>,
    copies: Mutex<Vec<(String, String, Bytes)>>,
    execs: Mutex<Vec<(String, Vec<String>)>>,
    exec_failures: Mutex<Vec<(String, String)>>,
    failures: FailureScript,
}

impl MockContainers {
    /// Create an empty container mock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call to `op` fail with an adapter error.
    pub fn fail_once(&self, op: &str) {
        self.failures.push(op);
    }

    /// Make execs whose command line contains `needle` exit nonzero with
    /// `output` from now on.
    pub fn script_exec_failure(&self, needle: &str, output: &str) {
        self.exec_failures
            .lock()
            .unwrap()
            .push((needle.to_owned(), output.to_owned()));
    }

    /// Register a pre-existing running container (e.g. the shared edge).
    pub fn register_running(&self, name: &str) {
        self.containers.lock().unwrap().insert(
            name.to_owned(),
            MockContainer {
                spec: None,
                running: true,
            },
        );
    }

    /// Whether a container exists at all.
    pub fn container_exists(&self, name: &str) -> bool {
        self.containers.lock().unwrap().contains_key(name)
    }

    /// Whether a volume exists.
    pub fn volume_exists(&self, name: &str) -> bool {
        self.volumes.lock().unwrap().contains(name)
    }

    /// The spec a container was created with, if it was created via spec.
    pub fn created_spec(&self, name: &str) -> Option<ContainerSpec> {
        self.containers
            .lock()
            .unwrap()
            .get(name)
            .and_then(|c| c.spec.clone())
    }

    /// `(dest_dir, tar)` pairs copied into the named container.
    pub fn copies_to(&self, name: &str) -> Vec<(String, Bytes)> {
        self.copies
            .lock()
            .unwrap()
            .iter()
            .filter(|(container, _, _)| container == name)
            .map(|(_, dest, tar)| (dest.clone(), tar.clone()))
            .collect()
    }

    /// Commands executed in the named container.
    pub fn execs_in(&self, name: &str) -> Vec<Vec<String>> {
        self.execs
            .lock()
            .unwrap()
            .iter()
            .filter(|(container, _)| container == name)
            .map(|(_, cmd)| cmd.clone())
            .collect()
    }

    fn create_or_start(&self, spec: &ContainerSpec) {
        let mut containers = self.containers.lock().unwrap();
        containers
            .entry(spec.name.clone())
            .and_modify(|c| c.running = true)
            .or_insert_with(|| MockContainer {
                spec: Some(spec.clone()),
                running: true,
            });
    }
}

#[async_trait]
impl ContainerOps for MockContainers {
    async fn inspect_status(&self, name: &str) -> InfraResult<ContainerStatus> {
        self.failures.check("docker", "inspect_status")?;
        Ok(match self.containers.lock().unwrap().get(name) {
            None => ContainerStatus::Missing,
            Some(c) if c.running => ContainerStatus::Running,
            Some(_) => ContainerStatus::Exited,
        })
    }

    async fn create_app(&self, spec: &ContainerSpec) -> InfraResult<()> {
        self.failures.check("docker", "create_app")?;
        self.create_or_start(spec);
        Ok(())
    }

    async fn create_sidecar(&self, spec: &ContainerSpec) -> InfraResult<()> {
        self.failures.check("docker", "create_sidecar")?;
        self.create_or_start(spec);
        Ok(())
    }

    async fn start(&self, name: &str) -> InfraResult<()> {
        self.failures.check("docker", "start")?;
        match self.containers.lock().unwrap().get_mut(name) {
            Some(c) => {
                c.running = true;
                Ok(())
            }
            None => Err(InfraError::not_found("docker", name)),
        }
    }

    async fn stop(&self, name: &str, _timeout: Duration) -> InfraResult<()> {
        self.failures.check("docker", "stop")?;
        match self.containers.lock().unwrap().get_mut(name) {
            Some(c) => {
                c.running = false;
                Ok(())
            }
            None => Err(InfraError::not_found("docker", name)),
        }
    }

    async fn remove(&self, name: &str, _force: bool) -> InfraResult<()> {
        self.failures.check("docker", "remove")?;
        if self.containers.lock().unwrap().remove(name).is_none() {
            return Err(InfraError::not_found("docker", name));
        }
        Ok(())
    }

    async fn copy_tar(&self, container: &str, dest_dir: &str, tar: Bytes) -> InfraResult<()> {
        self.failures.check("docker", "copy_tar")?;
        if !self.container_exists(container) {
            return Err(InfraError::not_found("docker", container));
        }
        self.copies
            .lock()
            .unwrap()
            .push((container.to_owned(), dest_dir.to_owned(), tar));
        Ok(())
    }

    async fn exec(&self, container: &str, cmd: &[&str]) -> InfraResult<ExecOutput> {
        self.failures.check("docker", "exec")?;
        if !self.container_exists(container) {
            return Err(InfraError::not_found("docker", container));
        }

        let cmd_line = cmd.join(" ");
        self.execs.lock().unwrap().push((
            container.to_owned(),
            cmd.iter().map(|s| (*s).to_owned()).collect(),
        ));

        let failures = self.exec_failures.lock().unwrap();
        if let Some((_, output)) = failures.iter().find(|(needle, _)| cmd_line.contains(needle)) {
            return Ok(ExecOutput {
                exit_code: 1,
                output: output.clone(),
            });
        }

        Ok(ExecOutput {
            exit_code: 0,
            output: String::new(),
        })
    }

    async fn volume_create(&self, name: &str) -> InfraResult<()> {
        self.failures.check("docker", "volume_create")?;
        self.volumes.lock().unwrap().insert(name.to_owned());
        Ok(())
    }

    async fn volume_remove(&self, name: &str, _force: bool) -> InfraResult<()> {
        self.failures.check("docker", "volume_remove")?;
        if !self.volumes.lock().unwrap().remove(name) {
            return Err(InfraError::not_found("docker", name));
        }
        Ok(())
    }
}

/// In-memory [`EdgeConfigOps`].
#[derive(Debug, Default)]
pub struct MockEdge {
    snippets: Mutex<HashMap<String, Vec<u8>>>,
    certs: Mutex<HashSet<String>>,
    reloads: AtomicUsize,
    failures: FailureScript,
}

impl MockEdge {
    /// Create an empty edge mock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call to `op` fail with an adapter error.
    pub fn fail_once(&self, op: &str) {
        self.failures.push(op);
    }

    /// Current snippet text for a site.
    pub fn snippet(&self, site: &str) -> Option<String> {
        self.snippets
            .lock()
            .unwrap()
            .get(site)
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    /// How many reloads have been applied.
    pub fn reloads(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }

    /// Mark a certificate as issued on disk.
    pub fn issue_cert(&self, domain: &str) {
        self.certs.lock().unwrap().insert(domain.to_owned());
    }
}

#[async_trait]
impl EdgeConfigOps for MockEdge {
    async fn ensure_snippet_dir(&self) -> InfraResult<()> {
        self.failures.check("edge", "ensure_snippet_dir")
    }

    async fn write_snippet(&self, site: &str, contents: Bytes) -> InfraResult<()> {
        self.failures.check("edge", "write_snippet")?;
        self.snippets
            .lock()
            .unwrap()
            .insert(site.to_owned(), contents.to_vec());
        Ok(())
    }

    async fn remove_snippet(&self, site: &str) -> InfraResult<()> {
        self.failures.check("edge", "remove_snippet")?;
        self.snippets.lock().unwrap().remove(site);
        Ok(())
    }

    async fn reload(&self) -> InfraResult<()> {
        self.failures.check("edge", "reload")?;
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn snippet_exists(&self, site: &str) -> InfraResult<bool> {
        self.failures.check("edge", "snippet_exists")?;
        Ok(self.snippets.lock().unwrap().contains_key(site))
    }

    async fn snippet_contains(&self, site: &str, needle: &str) -> InfraResult<bool> {
        self.failures.check("edge", "snippet_contains")?;
        Ok(self
            .snippet(site)
            .is_some_and(|text| text.contains(needle)))
    }

    async fn cert_on_disk(&self, domain: &str) -> InfraResult<bool> {
        self.failures.check("edge", "cert_on_disk")?;
        Ok(self.certs.lock().unwrap().contains(domain))
    }
}

/// In-memory [`AppDbOps`].
#[derive(Debug, Default)]
pub struct MockAppDb {
    databases: Mutex<HashSet<String>>,
    urls: Mutex<HashMap<String, String>>,
    failures: FailureScript,
}

impl MockAppDb {
    /// Create an empty application-db mock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call to `op` fail with an adapter error.
    pub fn fail_once(&self, op: &str) {
        self.failures.push(op);
    }

    /// Whether the database currently exists.
    pub fn has_database(&self, db: &str) -> bool {
        self.databases.lock().unwrap().contains(db)
    }

    /// The last URL written into a database's option rows.
    pub fn site_url(&self, db: &str) -> Option<String> {
        self.urls.lock().unwrap().get(db).cloned()
    }
}

#[async_trait]
impl AppDbOps for MockAppDb {
    async fn create_database_and_user(
        &self,
        db: &str,
        _user: &str,
        _password: &str,
        _from_host: &str,
    ) -> InfraResult<()> {
        self.failures.check("appdb", "create_database_and_user")?;
        self.databases.lock().unwrap().insert(db.to_owned());
        Ok(())
    }

    async fn drop_database_and_user(
        &self,
        db: &str,
        _user: &str,
        _from_host: &str,
    ) -> InfraResult<()> {
        self.failures.check("appdb", "drop_database_and_user")?;
        self.databases.lock().unwrap().remove(db);
        self.urls.lock().unwrap().remove(db);
        Ok(())
    }

    async fn update_site_urls(&self, db: &str, url: &str) -> InfraResult<()> {
        self.failures.check("appdb", "update_site_urls")?;
        if !self.has_database(db) {
            return Err(InfraError::not_found("appdb", db));
        }
        self.urls
            .lock()
            .unwrap()
            .insert(db.to_owned(), url.to_owned());
        Ok(())
    }
}

/// In-memory [`DnsResolve`] with preset records.
#[derive(Debug, Default)]
pub struct MockDns {
    records: Mutex<HashMap<String, Vec<Ipv4Addr>>>,
}

impl MockDns {
    /// Create an empty resolver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the A records for a domain.
    pub fn set_a(&self, domain: &str, addrs: Vec<Ipv4Addr>) {
        self.records
            .lock()
            .unwrap()
            .insert(domain.to_owned(), addrs);
    }
}

#[async_trait]
impl DnsResolve for MockDns {
    async fn lookup_a(&self, domain: &str) -> InfraResult<Vec<Ipv4Addr>> {
        self.records
            .lock()
            .unwrap()
            .get(domain)
            .cloned()
            .ok_or_else(|| InfraError::adapter("dns", format!("{domain} does not resolve")))
    }
}

/// In-memory [`ArchiveOps`] serving preset tar streams.
#[derive(Debug, Default)]
pub struct MockArchive {
    tars: Mutex<HashMap<PathBuf, Bytes>>,
    failures: FailureScript,
}

impl MockArchive {
    /// Create an empty archive mock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call to `op` fail with an adapter error.
    pub fn fail_once(&self, op: &str) {
        self.failures.push(op);
    }

    /// Preset the tar stream returned for a staged archive path.
    pub fn stage(&self, path: impl Into<PathBuf>, tar: Bytes) {
        self.tars.lock().unwrap().insert(path.into(), tar);
    }
}

#[async_trait]
impl ArchiveOps for MockArchive {
    async fn extract_zip(&self, path: &Path) -> InfraResult<Bytes> {
        self.failures.check("archive", "extract_zip")?;
        self.tars
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| {
                InfraError::adapter("archive", format!("no staged archive at {}", path.display()))
            })
    }
}

/// In-memory [`TunnelConfigOps`].
#[derive(Debug, Default)]
pub struct MockTunnel {
    hostnames: Mutex<HashSet<String>>,
    failures: FailureScript,
}

impl MockTunnel {
    /// Create an empty tunnel mock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call to `op` fail with an adapter error.
    pub fn fail_once(&self, op: &str) {
        self.failures.push(op);
    }
}

#[async_trait]
impl TunnelConfigOps for MockTunnel {
    async fn ensure_ingress(&self, hostname: &str) -> InfraResult<()> {
        self.failures.check("tunnel", "ensure_ingress")?;
        self.hostnames.lock().unwrap().insert(hostname.to_owned());
        Ok(())
    }

    async fn remove_ingress(&self, hostname: &str) -> InfraResult<()> {
        self.failures.check("tunnel", "remove_ingress")?;
        self.hostnames.lock().unwrap().remove(hostname);
        Ok(())
    }

    async fn has_ingress(&self, hostname: &str) -> InfraResult<bool> {
        Ok(self.hostnames.lock().unwrap().contains(hostname))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn containers_create_is_idempotent() {
        let containers = MockContainers::new();
        let spec = ContainerSpec::scratch("tmp", "vol", "/data");

        containers.create_app(&spec).await.unwrap();
        containers.stop("tmp", Duration::from_secs(1)).await.unwrap();
        assert_eq!(
            containers.inspect_status("tmp").await.unwrap(),
            ContainerStatus::Exited
        );

        // Re-creating an existing container just starts it.
        containers.create_app(&spec).await.unwrap();
        assert_eq!(
            containers.inspect_status("tmp").await.unwrap(),
            ContainerStatus::Running
        );
    }

    #[tokio::test]
    async fn scripted_failure_fires_once() {
        let containers = MockContainers::new();
        containers.fail_once("volume_create");

        assert!(containers.volume_create("v").await.is_err());
        assert!(containers.volume_create("v").await.is_ok());
    }

    #[tokio::test]
    async fn removing_absent_resources_is_distinguishable() {
        let containers = MockContainers::new();
        let err = containers.remove("ghost", true).await.unwrap_err();
        assert!(err.is_not_found());

        let err = containers.volume_remove("ghost", true).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn edge_snippets_round_trip() {
        let edge = MockEdge::new();
        edge.write_snippet("s", Bytes::from_static(b"s.hosto.com {}"))
            .await
            .unwrap();

        assert!(edge.snippet_exists("s").await.unwrap());
        assert!(edge.snippet_contains("s", "s.hosto.com").await.unwrap());
        assert!(!edge.snippet_contains("s", "other.com").await.unwrap());

        edge.remove_snippet("s").await.unwrap();
        assert!(!edge.snippet_exists("s").await.unwrap());
    }
}
