//! Docker Engine API client and the container-ops adapter built on it.
//!
//! The daemon is driven over its versioned HTTP API with mutual TLS (the
//! container host only accepts authenticated clients). Only the handful of
//! endpoints the control plane needs are mapped; each call carries a
//! bounded deadline.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Certificate, Client, Identity, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::error::{InfraError, InfraResult};
use crate::traits::{ContainerOps, ContainerSpec, ContainerStatus, ExecOutput};

/// Docker Engine API version prefix.
const API_VERSION: &str = "v1.44";

const INSPECT_TIMEOUT: Duration = Duration::from_secs(10);
const CREATE_TIMEOUT: Duration = Duration::from_secs(60);
const START_TIMEOUT: Duration = Duration::from_secs(30);
const REMOVE_TIMEOUT: Duration = Duration::from_secs(30);
const COPY_TIMEOUT: Duration = Duration::from_secs(60);
const EXEC_TIMEOUT: Duration = Duration::from_secs(60);
const VOLUME_TIMEOUT: Duration = Duration::from_secs(30);

/// Client certificate material for mutual TLS with the daemon.
#[derive(Debug, Clone)]
pub struct DockerTlsConfig {
    pub ca_pem: Vec<u8>,
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

impl DockerTlsConfig {
    /// Load `ca.pem`, `cert.pem`, and `key.pem` from a certificate
    /// directory.
    pub fn from_dir(dir: impl AsRef<Path>) -> InfraResult<Self> {
        let dir = dir.as_ref();
        let read = |name: &str| {
            std::fs::read(dir.join(name)).map_err(|e| {
                InfraError::adapter("docker", format!("read {}: {e}", dir.join(name).display()))
            })
        };
        Ok(Self {
            ca_pem: read("ca.pem")?,
            cert_pem: read("cert.pem")?,
            key_pem: read("key.pem")?,
        })
    }
}

/// Minimal HTTP client for the Docker Engine API.
#[derive(Debug, Clone)]
pub struct DockerClient {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct ContainerInspect {
    #[serde(rename = "State")]
    state: ContainerState,
}

#[derive(Debug, Deserialize)]
struct ContainerState {
    #[serde(rename = "Running")]
    running: bool,
}

#[derive(Debug, Deserialize)]
struct ExecCreated {
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Debug, Deserialize)]
struct ExecInspect {
    #[serde(rename = "ExitCode")]
    exit_code: Option<i64>,
    #[serde(rename = "Running")]
    running: bool,
}

#[derive(Debug, Deserialize)]
struct DaemonError {
    message: String,
}

impl DockerClient {
    /// Connect to a daemon over mutual TLS.
    ///
    /// `docker_host` is the `tcp://host:port` endpoint; with TLS material
    /// it is dialled as HTTPS.
    pub fn new(docker_host: &str, tls: &DockerTlsConfig) -> InfraResult<Self> {
        let mut identity_pem = tls.cert_pem.clone();
        identity_pem.extend_from_slice(&tls.key_pem);

        let client = Client::builder()
            .use_rustls_tls()
            .add_root_certificate(
                Certificate::from_pem(&tls.ca_pem)
                    .map_err(|e| InfraError::adapter("docker", format!("daemon CA: {e}")))?,
            )
            .identity(
                Identity::from_pem(&identity_pem)
                    .map_err(|e| InfraError::adapter("docker", format!("client identity: {e}")))?,
            )
            .build()
            .map_err(|e| InfraError::adapter("docker", e.to_string()))?;

        Ok(Self {
            client,
            base_url: Self::base_url(docker_host, true),
        })
    }

    /// Connect without TLS (plain-HTTP daemons; tests).
    pub fn insecure(docker_host: &str) -> InfraResult<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| InfraError::adapter("docker", e.to_string()))?;

        Ok(Self {
            client,
            base_url: Self::base_url(docker_host, false),
        })
    }

    fn base_url(docker_host: &str, tls: bool) -> String {
        let scheme = if tls { "https" } else { "http" };
        let host = docker_host
            .trim_start_matches("tcp://")
            .trim_start_matches("http://")
            .trim_start_matches("https://")
            .trim_end_matches('/');
        format!("{scheme}://{host}/{API_VERSION}")
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Map a non-success response to an adapter or not-found error.
    async fn check(resp: Response, resource: &str) -> InfraResult<Response> {
        let status = resp.status();
        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            return Ok(resp);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(InfraError::not_found("docker", resource));
        }

        let message = match resp.json::<DaemonError>().await {
            Ok(body) => body.message,
            Err(_) => format!("daemon returned {status}"),
        };
        Err(InfraError::adapter("docker", message))
    }

    fn transport(e: reqwest::Error) -> InfraError {
        InfraError::adapter("docker", e.to_string())
    }

    /// Inspect a container; `None` when it does not exist.
    pub async fn inspect_container(&self, name: &str) -> InfraResult<Option<bool>> {
        let resp = self
            .client
            .get(self.url(&format!("/containers/{name}/json")))
            .timeout(INSPECT_TIMEOUT)
            .send()
            .await
            .map_err(Self::transport)?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = Self::check(resp, name).await?;
        let inspect: ContainerInspect = resp.json().await.map_err(Self::transport)?;
        Ok(Some(inspect.state.running))
    }

    /// Create a container from a raw Engine-API body.
    pub async fn create_container(&self, name: &str, body: &serde_json::Value) -> InfraResult<()> {
        let resp = self
            .client
            .post(self.url("/containers/create"))
            .query(&[("name", name)])
            .timeout(CREATE_TIMEOUT)
            .json(body)
            .send()
            .await
            .map_err(Self::transport)?;

        Self::check(resp, name).await?;
        Ok(())
    }

    /// Start a container; already-started is success.
    pub async fn start_container(&self, name: &str) -> InfraResult<()> {
        let resp = self
            .client
            .post(self.url(&format!("/containers/{name}/start")))
            .timeout(START_TIMEOUT)
            .send()
            .await
            .map_err(Self::transport)?;

        Self::check(resp, name).await?;
        Ok(())
    }

    /// Stop a container; already-stopped is success.
    pub async fn stop_container(&self, name: &str, timeout: Duration) -> InfraResult<()> {
        let secs = timeout.as_secs().to_string();
        let resp = self
            .client
            .post(self.url(&format!("/containers/{name}/stop")))
            .query(&[("t", secs.as_str())])
            .timeout(timeout + Duration::from_secs(10))
            .send()
            .await
            .map_err(Self::transport)?;

        Self::check(resp, name).await?;
        Ok(())
    }

    /// Remove a container.
    pub async fn remove_container(&self, name: &str, force: bool) -> InfraResult<()> {
        let resp = self
            .client
            .delete(self.url(&format!("/containers/{name}")))
            .query(&[("force", if force { "true" } else { "false" })])
            .timeout(REMOVE_TIMEOUT)
            .send()
            .await
            .map_err(Self::transport)?;

        Self::check(resp, name).await?;
        Ok(())
    }

    /// Upload a tar archive to a directory inside the container.
    pub async fn put_archive(&self, name: &str, dest_dir: &str, tar: Bytes) -> InfraResult<()> {
        let resp = self
            .client
            .put(self.url(&format!("/containers/{name}/archive")))
            .query(&[("path", dest_dir)])
            .timeout(COPY_TIMEOUT)
            .header("Content-Type", "application/x-tar")
            .body(tar)
            .send()
            .await
            .map_err(Self::transport)?;

        Self::check(resp, name).await?;
        Ok(())
    }

    /// Run a command in the container, waiting for completion.
    ///
    /// The exec is started attached with a TTY, so the response body is
    /// the raw combined output and EOF marks completion; the exit code is
    /// read back from the exec record afterwards.
    pub async fn exec(&self, name: &str, cmd: &[&str]) -> InfraResult<ExecOutput> {
        let resp = self
            .client
            .post(self.url(&format!("/containers/{name}/exec")))
            .timeout(EXEC_TIMEOUT)
            .json(&json!({
                "AttachStdout": true,
                "AttachStderr": true,
                "Tty": true,
                "Cmd": cmd,
            }))
            .send()
            .await
            .map_err(Self::transport)?;
        let created: ExecCreated = Self::check(resp, name)
            .await?
            .json()
            .await
            .map_err(Self::transport)?;

        let resp = self
            .client
            .post(self.url(&format!("/exec/{}/start", created.id)))
            .timeout(EXEC_TIMEOUT)
            .json(&json!({ "Detach": false, "Tty": true }))
            .send()
            .await
            .map_err(Self::transport)?;
        let output_bytes = Self::check(resp, name)
            .await?
            .bytes()
            .await
            .map_err(Self::transport)?;

        let resp = self
            .client
            .get(self.url(&format!("/exec/{}/json", created.id)))
            .timeout(INSPECT_TIMEOUT)
            .send()
            .await
            .map_err(Self::transport)?;
        let inspect: ExecInspect = Self::check(resp, name)
            .await?
            .json()
            .await
            .map_err(Self::transport)?;

        if inspect.running {
            return Err(InfraError::invariant(
                "docker",
                format!("exec in {name} still running after its stream closed"),
            ));
        }

        Ok(ExecOutput {
            exit_code: inspect.exit_code.unwrap_or(-1),
            output: String::from_utf8_lossy(&output_bytes).into_owned(),
        })
    }

    /// Create a named volume (idempotent at the daemon).
    pub async fn volume_create(&self, name: &str) -> InfraResult<()> {
        let resp = self
            .client
            .post(self.url("/volumes/create"))
            .timeout(VOLUME_TIMEOUT)
            .json(&json!({ "Name": name }))
            .send()
            .await
            .map_err(Self::transport)?;

        Self::check(resp, name).await?;
        Ok(())
    }

    /// Remove a named volume.
    pub async fn volume_remove(&self, name: &str, force: bool) -> InfraResult<()> {
        let resp = self
            .client
            .delete(self.url(&format!("/volumes/{name}")))
            .query(&[("force", if force { "true" } else { "false" })])
            .timeout(VOLUME_TIMEOUT)
            .send()
            .await
            .map_err(Self::transport)?;

        Self::check(resp, name).await?;
        Ok(())
    }
}

/// Engine-API container-create body for a [`ContainerSpec`].
fn container_create_body(spec: &ContainerSpec) -> serde_json::Value {
    let mut body = json!({
        "Image": spec.image,
        "Env": spec.env,
        "HostConfig": {
            "Mounts": [{
                "Type": "volume",
                "Source": spec.volume,
                "Target": spec.mount_target,
                "ReadOnly": spec.read_only,
            }],
            "Memory": spec.memory_bytes,
            "NanoCpus": spec.nano_cpus,
            "PidsLimit": spec.pids_limit,
        },
    });

    if spec.restart_unless_stopped {
        body["HostConfig"]["RestartPolicy"] = json!({ "Name": "unless-stopped" });
    }
    if let Some(cmd) = &spec.cmd {
        body["Cmd"] = json!(cmd);
    }
    if let Some(network) = &spec.network {
        let mut endpoints = serde_json::Map::new();
        endpoints.insert(network.clone(), json!({}));
        body["NetworkingConfig"] = json!({ "EndpointsConfig": endpoints });
    }

    body
}

/// [`ContainerOps`] over a [`DockerClient`].
#[derive(Debug, Clone)]
pub struct DockerContainerOps {
    client: DockerClient,
}

impl DockerContainerOps {
    /// Wrap a Docker client.
    #[must_use]
    pub fn new(client: DockerClient) -> Self {
        Self { client }
    }

    /// Create-or-start: if the container already exists it is started,
    /// which makes provisioning steps safe to re-execute.
    async fn create_or_start(&self, spec: &ContainerSpec) -> InfraResult<()> {
        if self.client.inspect_container(&spec.name).await?.is_some() {
            debug!(container = %spec.name, "container already exists, starting");
            return self.client.start_container(&spec.name).await;
        }

        self.client
            .create_container(&spec.name, &container_create_body(spec))
            .await?;
        self.client.start_container(&spec.name).await
    }
}

#[async_trait]
impl ContainerOps for DockerContainerOps {
    async fn inspect_status(&self, name: &str) -> InfraResult<ContainerStatus> {
        Ok(match self.client.inspect_container(name).await? {
            None => ContainerStatus::Missing,
            Some(true) => ContainerStatus::Running,
            Some(false) => ContainerStatus::Exited,
        })
    }

    async fn create_app(&self, spec: &ContainerSpec) -> InfraResult<()> {
        self.create_or_start(spec).await
    }

    async fn create_sidecar(&self, spec: &ContainerSpec) -> InfraResult<()> {
        self.create_or_start(spec).await
    }

    async fn start(&self, name: &str) -> InfraResult<()> {
        self.client.start_container(name).await
    }

    async fn stop(&self, name: &str, timeout: Duration) -> InfraResult<()> {
        self.client.stop_container(name, timeout).await
    }

    async fn remove(&self, name: &str, force: bool) -> InfraResult<()> {
        self.client.remove_container(name, force).await
    }

    async fn copy_tar(&self, container: &str, dest_dir: &str, tar: Bytes) -> InfraResult<()> {
        self.client.put_archive(container, dest_dir, tar).await
    }

    async fn exec(&self, container: &str, cmd: &[&str]) -> InfraResult<ExecOutput> {
        self.client.exec(container, cmd).await
    }

    async fn volume_create(&self, name: &str) -> InfraResult<()> {
        self.client.volume_create(name).await
    }

    async fn volume_remove(&self, name: &str, force: bool) -> InfraResult<()> {
        self.client.volume_remove(name, force).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_strips_tcp_scheme() {
        assert_eq!(
            DockerClient::base_url("tcp://10.10.0.10:2376", true),
            "https://10.10.0.10:2376/v1.44"
        );
        assert_eq!(
            DockerClient::base_url("tcp://localhost:2375", false),
            "http://localhost:2375/v1.44"
        );
    }

    #[test]
    fn create_body_renders_limits_and_mount() {
        let spec = ContainerSpec {
            name: "php_mysite".to_owned(),
            image: "wordpress:php8.2-fpm".to_owned(),
            env: vec!["WORDPRESS_DB_NAME=wp_mysite".to_owned()],
            volume: "wp_mysite".to_owned(),
            mount_target: "/var/www/html".to_owned(),
            read_only: false,
            memory_bytes: 512 * 1024 * 1024,
            nano_cpus: 1_000_000_000,
            pids_limit: 100,
            network: Some("wp_backend".to_owned()),
            cmd: None,
            restart_unless_stopped: true,
        };

        let body = container_create_body(&spec);
        assert_eq!(body["Image"], "wordpress:php8.2-fpm");
        assert_eq!(body["HostConfig"]["Memory"], 536_870_912_i64);
        assert_eq!(body["HostConfig"]["NanoCpus"], 1_000_000_000_i64);
        assert_eq!(body["HostConfig"]["PidsLimit"], 100);
        assert_eq!(body["HostConfig"]["RestartPolicy"]["Name"], "unless-stopped");
        assert_eq!(body["HostConfig"]["Mounts"][0]["Source"], "wp_mysite");
        assert_eq!(body["HostConfig"]["Mounts"][0]["ReadOnly"], false);
        assert!(body["NetworkingConfig"]["EndpointsConfig"]["wp_backend"].is_object());
        assert!(body.get("Cmd").is_none());
    }

    #[test]
    fn scratch_spec_sleeps_without_restart() {
        let spec = ContainerSpec::scratch("tmp_upload_static", "static", "/srv/sites");
        let body = container_create_body(&spec);
        assert_eq!(body["Cmd"][0], "sleep");
        assert!(body["HostConfig"].get("RestartPolicy").is_none());
    }
}
