//! Edge router (Caddy) configuration operations.
//!
//! All edits happen inside the shared edge container through the container
//! daemon: snippets are tar-streamed into the snippet directory and the
//! router is reloaded with validate-then-apply semantics. Certificate
//! presence is probed on the edge container's disk under the configured
//! certificate directory.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use webfleet_core::naming;

use crate::error::{InfraError, InfraResult};
use crate::traits::{ContainerOps, EdgeConfigOps};

const CADDYFILE: &str = "/etc/caddy/Caddyfile";

/// [`EdgeConfigOps`] for a Caddy edge container.
pub struct CaddyEdgeOps {
    containers: Arc<dyn ContainerOps>,
    /// Name of the shared edge container.
    container: String,
    /// Snippet directory inside the edge container.
    conf_dir: String,
    /// Certificate storage directory inside the edge container.
    cert_dir: String,
}

impl CaddyEdgeOps {
    /// Create edge ops for the given container and directories.
    pub fn new(
        containers: Arc<dyn ContainerOps>,
        container: impl Into<String>,
        conf_dir: impl Into<String>,
        cert_dir: impl Into<String>,
    ) -> Self {
        Self {
            containers,
            container: container.into(),
            conf_dir: conf_dir.into().trim_end_matches('/').to_owned(),
            cert_dir: cert_dir.into().trim_end_matches('/').to_owned(),
        }
    }

    fn snippet_path(&self, site: &str) -> String {
        format!("{}/{}", self.conf_dir, naming::snippet_file(site))
    }

    fn cert_path(&self, domain: &str) -> String {
        format!("{}/{domain}/{domain}.crt", self.cert_dir)
    }

    /// Run a command in the edge container, mapping nonzero exit to an
    /// adapter error carrying the combined output.
    async fn exec_checked(&self, cmd: &[&str], what: &str) -> InfraResult<()> {
        let out = self.containers.exec(&self.container, cmd).await?;
        if out.success() {
            Ok(())
        } else {
            Err(InfraError::adapter(
                "edge",
                format!("{what} failed: {}", out.output.trim()),
            ))
        }
    }

    /// Run a probe command; the exit code is the answer.
    async fn exec_probe(&self, cmd: &[&str]) -> InfraResult<bool> {
        let out = self.containers.exec(&self.container, cmd).await?;
        Ok(out.success())
    }
}

/// Build a single-file tar archive for streaming into a container.
pub fn tar_single_file(name: &str, contents: &[u8], mode: u32) -> InfraResult<Bytes> {
    let mut data = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut data);
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(mode);
        header.set_cksum();
        builder
            .append_data(&mut header, name, contents)
            .map_err(|e| InfraError::adapter("edge", format!("tar {name}: {e}")))?;
        builder
            .finish()
            .map_err(|e| InfraError::adapter("edge", format!("tar finish: {e}")))?;
    }
    Ok(Bytes::from(data))
}

#[async_trait]
impl EdgeConfigOps for CaddyEdgeOps {
    async fn ensure_snippet_dir(&self) -> InfraResult<()> {
        self.exec_checked(&["mkdir", "-p", &self.conf_dir], "snippet dir creation")
            .await
    }

    async fn write_snippet(&self, site: &str, contents: Bytes) -> InfraResult<()> {
        // The archive endpoint needs the destination directory to exist.
        self.ensure_snippet_dir().await?;

        let archive = tar_single_file(&naming::snippet_file(site), &contents, 0o644)?;
        self.containers
            .copy_tar(&self.container, &self.conf_dir, archive)
            .await?;

        debug!(site = %site, "edge snippet written");
        Ok(())
    }

    async fn remove_snippet(&self, site: &str) -> InfraResult<()> {
        self.exec_checked(
            &["rm", "-f", &self.snippet_path(site)],
            "snippet removal",
        )
        .await
    }

    async fn reload(&self) -> InfraResult<()> {
        self.exec_checked(
            &["caddy", "validate", "--config", CADDYFILE],
            "config validation",
        )
        .await?;
        self.exec_checked(&["caddy", "reload", "--config", CADDYFILE], "reload")
            .await
    }

    async fn snippet_exists(&self, site: &str) -> InfraResult<bool> {
        self.exec_probe(&["test", "-f", &self.snippet_path(site)]).await
    }

    async fn snippet_contains(&self, site: &str, needle: &str) -> InfraResult<bool> {
        self.exec_probe(&["grep", "-q", needle, &self.snippet_path(site)])
            .await
    }

    async fn cert_on_disk(&self, domain: &str) -> InfraResult<bool> {
        self.exec_probe(&["test", "-f", &self.cert_path(domain)]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockContainers;

    fn edge_with_mock() -> (Arc<MockContainers>, CaddyEdgeOps) {
        let containers = Arc::new(MockContainers::new());
        let edge = CaddyEdgeOps::new(
            Arc::clone(&containers) as Arc<dyn ContainerOps>,
            "edge-caddy",
            "/etc/caddy/sites/",
            "/data/caddy/certificates/acme",
        );
        (containers, edge)
    }

    #[test]
    fn paths_follow_naming() {
        let (_, edge) = edge_with_mock();
        assert_eq!(edge.snippet_path("mysite"), "/etc/caddy/sites/mysite.caddy");
        assert_eq!(
            edge.cert_path("example.com"),
            "/data/caddy/certificates/acme/example.com/example.com.crt"
        );
    }

    #[test]
    fn single_file_tar_contains_the_file() {
        let archive = tar_single_file("mysite.caddy", b"hello {}", 0o644).unwrap();

        let mut reader = tar::Archive::new(archive.as_ref());
        let mut entries = reader.entries().unwrap();
        let entry = entries.next().unwrap().unwrap();
        assert_eq!(entry.path().unwrap().to_str().unwrap(), "mysite.caddy");
        assert_eq!(entry.size(), 8);
        assert!(entries.next().is_none());
    }

    #[tokio::test]
    async fn write_snippet_lands_in_edge_container() {
        let (containers, edge) = edge_with_mock();
        containers.register_running("edge-caddy");

        edge.write_snippet("mysite", Bytes::from_static(b"mysite.hosto.com {}"))
            .await
            .unwrap();

        let copies = containers.copies_to("edge-caddy");
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].0, "/etc/caddy/sites");
    }

    #[tokio::test]
    async fn reload_validates_before_applying() {
        let (containers, edge) = edge_with_mock();
        containers.register_running("edge-caddy");

        edge.reload().await.unwrap();

        let execs = containers.execs_in("edge-caddy");
        assert_eq!(execs.len(), 2);
        assert_eq!(execs[0][1], "validate");
        assert_eq!(execs[1][1], "reload");
    }

    #[tokio::test]
    async fn failed_reload_surfaces_output() {
        let (containers, edge) = edge_with_mock();
        containers.register_running("edge-caddy");
        containers.script_exec_failure("caddy validate", "syntax error at line 3");

        let err = edge.reload().await.unwrap_err();
        assert!(err.to_string().contains("syntax error"));
    }
}
