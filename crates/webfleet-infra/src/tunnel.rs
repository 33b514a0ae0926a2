//! Cloudflared ingress-file maintenance.
//!
//! The tunnel daemon's catch-all ingress rule already routes every
//! tunnelled hostname to the service target, so these edits are a durable
//! record of which hostnames are served; they never restart the daemon.
//! Writes are atomic (temp file + rename) so a crash cannot leave a
//! half-written config behind.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{InfraError, InfraResult};
use crate::traits::TunnelConfigOps;

/// One ingress rule; a rule without a hostname is the catch-all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressRule {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub service: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TunnelFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    tunnel: Option<String>,
    #[serde(
        rename = "credentials-file",
        skip_serializing_if = "Option::is_none"
    )]
    credentials_file: Option<String>,
    #[serde(default)]
    ingress: Vec<IngressRule>,
}

/// [`TunnelConfigOps`] over a cloudflared configuration file.
#[derive(Debug, Clone)]
pub struct CloudflaredIngressFile {
    path: PathBuf,
    /// Upstream every ingress rule (including the catch-all) points at.
    service_target: String,
}

impl CloudflaredIngressFile {
    /// Manage the ingress rules of the config at `path`.
    pub fn new(path: impl Into<PathBuf>, service_target: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            service_target: service_target.into(),
        }
    }

    async fn load(&self) -> InfraResult<TunnelFile> {
        let data = tokio::fs::read(&self.path).await.map_err(|e| {
            InfraError::adapter(
                "tunnel",
                format!("read {}: {e}", self.path.display()),
            )
        })?;
        serde_yaml::from_slice(&data)
            .map_err(|e| InfraError::adapter("tunnel", format!("parse config: {e}")))
    }

    async fn save(&self, config: &TunnelFile) -> InfraResult<()> {
        let data = serde_yaml::to_string(config)
            .map_err(|e| InfraError::adapter("tunnel", format!("render config: {e}")))?;

        let tmp = self.path.with_extension("yml.tmp");
        tokio::fs::write(&tmp, data).await.map_err(|e| {
            InfraError::adapter("tunnel", format!("write {}: {e}", tmp.display()))
        })?;
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(InfraError::adapter(
                "tunnel",
                format!("rename config: {e}"),
            ));
        }
        Ok(())
    }

    /// The catch-all (last, hostname-less) rule must route to the service
    /// target rather than a 404; that is what lets ingress edits avoid a
    /// daemon restart.
    fn fix_catch_all(&self, config: &mut TunnelFile) {
        match config.ingress.last_mut() {
            Some(last) if last.hostname.is_none() => {
                if last.service != self.service_target {
                    last.service.clone_from(&self.service_target);
                }
            }
            _ => config.ingress.push(IngressRule {
                hostname: None,
                service: self.service_target.clone(),
            }),
        }
    }
}

#[async_trait]
impl TunnelConfigOps for CloudflaredIngressFile {
    async fn ensure_ingress(&self, hostname: &str) -> InfraResult<()> {
        let mut config = self.load().await?;

        if config
            .ingress
            .iter()
            .any(|r| r.hostname.as_deref() == Some(hostname))
        {
            debug!(hostname = %hostname, "hostname already in ingress config");
            return Ok(());
        }

        self.fix_catch_all(&mut config);

        // Insert before the catch-all, which stays last.
        let catch_all_index = config.ingress.len() - 1;
        config.ingress.insert(
            catch_all_index,
            IngressRule {
                hostname: Some(hostname.to_owned()),
                service: self.service_target.clone(),
            },
        );

        self.save(&config).await?;
        debug!(hostname = %hostname, "hostname added to ingress config");
        Ok(())
    }

    async fn remove_ingress(&self, hostname: &str) -> InfraResult<()> {
        let mut config = self.load().await?;

        let before = config.ingress.len();
        config
            .ingress
            .retain(|r| r.hostname.as_deref() != Some(hostname));

        if config.ingress.len() == before {
            debug!(hostname = %hostname, "hostname not in ingress config, nothing to remove");
            return Ok(());
        }

        self.save(&config).await?;
        debug!(hostname = %hostname, "hostname removed from ingress config");
        Ok(())
    }

    async fn has_ingress(&self, hostname: &str) -> InfraResult<bool> {
        let config = self.load().await?;
        Ok(config
            .ingress
            .iter()
            .any(|r| r.hostname.as_deref() == Some(hostname)))
    }
}
