//! Custom-domain attachment and removal.
//!
//! Both operations are synchronous transactions with the same discipline
//! as provisioning: validate everything first, change infrastructure, and
//! commit the durable record last. A commit failure after infrastructure
//! success is deliberately not rolled back; infrastructure already
//! matches the requested state, so retrying the same request converges.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info, warn};

use webfleet_core::{lifecycle, naming, SiteStatus};
use webfleet_infra::{
    tar_single_file, AppDbOps, ContainerOps, DnsResolve, EdgeConfigOps, TunnelConfigOps,
};
use webfleet_state::{SiteRecord, StateStore};

use crate::config::WebfleetConfig;
use crate::error::{ControlError, ControlResult};
use crate::probes::{CertPoller, CertStatus, DEFAULT_CERT_TIMEOUT};
use crate::render;

use super::{exec_ok, SiteKind};

const SIDECAR_CONF_DIR: &str = "/etc/nginx/conf.d";
const SIDECAR_CONF_FILE: &str = "default.conf";

/// Result of a successful attach.
#[derive(Debug, Clone)]
pub struct AttachOutcome {
    /// The requested domain was already attached; nothing changed.
    pub already_set: bool,
    pub default_domain: String,
    pub custom_domain: String,
    pub status: SiteStatus,
}

/// Result of a successful detach.
#[derive(Debug, Clone)]
pub struct DetachOutcome {
    pub default_domain: String,
    pub removed_domain: String,
}

/// Where a pending custom domain currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainStep {
    PendingDns,
    PendingCert,
    Active,
}

/// Read-only report for the domain-status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct DomainStatusReport {
    pub domain: String,
    pub expected_ip: Ipv4Addr,
    pub dns_ok: bool,
    pub resolved: Vec<Ipv4Addr>,
    pub cert_status: CertStatus,
    pub ready: bool,
    pub step: DomainStep,
}

/// Attaches and detaches custom domains across the sidecar, the edge
/// router, the tunnel ingress record, and the application's URL rows.
pub struct DomainManager {
    store: Arc<dyn StateStore>,
    containers: Arc<dyn ContainerOps>,
    edge: Arc<dyn EdgeConfigOps>,
    app_db: Arc<dyn AppDbOps>,
    dns: Arc<dyn DnsResolve>,
    tunnel: Arc<dyn TunnelConfigOps>,
    cert_poller: CertPoller,
    cert_timeout: Duration,
    cfg: WebfleetConfig,
}

impl DomainManager {
    /// Create a domain manager over the given adapters.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn StateStore>,
        containers: Arc<dyn ContainerOps>,
        edge: Arc<dyn EdgeConfigOps>,
        app_db: Arc<dyn AppDbOps>,
        dns: Arc<dyn DnsResolve>,
        tunnel: Arc<dyn TunnelConfigOps>,
        cfg: WebfleetConfig,
    ) -> Self {
        Self {
            store,
            containers,
            cert_poller: CertPoller::new(Arc::clone(&edge)),
            edge,
            app_db,
            dns,
            tunnel,
            cert_timeout: DEFAULT_CERT_TIMEOUT,
            cfg,
        }
    }

    /// Override certificate polling cadence (tests).
    #[must_use]
    pub fn with_cert_polling(mut self, tick: Duration, timeout: Duration) -> Self {
        self.cert_poller = CertPoller::with_tick(Arc::clone(&self.edge), tick);
        self.cert_timeout = timeout;
        self
    }

    /// Attach a custom domain to a site.
    ///
    /// Flow: validate, apply infrastructure, commit the record last.
    pub async fn attach(&self, site: &str, domain: &str) -> ControlResult<AttachOutcome> {
        let domain = domain.trim().to_lowercase();

        lifecycle::validate_custom_domain(&domain, &self.cfg.base_domain)?;

        let record = self.require_site(site).await?;
        if !matches!(
            record.status,
            SiteStatus::Active | SiteStatus::DomainActive
        ) {
            return Err(ControlError::conflict(
                "site must be ACTIVE to set custom domain",
            ));
        }

        // Idempotent: the domain is already attached.
        if record.custom_domain.as_deref() == Some(domain.as_str()) {
            return Ok(AttachOutcome {
                already_set: true,
                default_domain: record.domain,
                custom_domain: domain,
                status: record.status,
            });
        }

        self.store.ensure_domain_available(&domain, site).await?;

        let kind = self.site_kind(&record).await;
        let previous = record.custom_domain.as_deref();

        // A site attaching its first domain walks the staged lifecycle;
        // a domain change on DOMAIN_ACTIVE keeps its status.
        let staged = record.status == SiteStatus::Active;
        if staged {
            self.store
                .transition_site(site, SiteStatus::DomainPending)
                .await?;
            self.store
                .transition_site(site, SiteStatus::DomainValidating)
                .await?;
        }

        if let Err(e) = self.check_dns(&domain).await {
            self.revert_to_active(site, staged).await;
            return Err(e);
        }

        if staged {
            self.store
                .transition_site(site, SiteStatus::DomainRouting)
                .await?;
        }

        if let Err(e) = self
            .apply_routing(site, &record.domain, kind, previous, Some(&domain))
            .await
        {
            self.revert_to_active(site, staged).await;
            return Err(e);
        }

        // Application URL rows follow along; failure is only a warning
        // because the sidecar passes the live hostname through anyway.
        if kind == SiteKind::WordPress {
            if let Err(e) = self
                .app_db
                .update_site_urls(&naming::app_database(site), &format!("https://{domain}"))
                .await
            {
                warn!(site = %site, error = %e, "application URL update failed, continuing");
            }
        }

        // Commit the durable record last.
        if let Err(e) = self.store.set_custom_domain(site, Some(&domain)).await {
            error!(
                site = %site,
                domain = %domain,
                error = %e,
                "CRITICAL: infra applied but domain commit failed"
            );
            self.revert_to_active(site, staged).await;
            return Err(ControlError::AppliedNotPersisted(
                "domain applied but failed to persist; retry the request".to_owned(),
            ));
        }

        let status = if staged {
            self.store
                .transition_site(site, SiteStatus::DomainActive)
                .await?;
            SiteStatus::DomainActive
        } else {
            record.status
        };

        info!(site = %site, domain = %domain, "custom domain attached");
        Ok(AttachOutcome {
            already_set: false,
            default_domain: record.domain,
            custom_domain: domain,
            status,
        })
    }

    /// Remove a site's custom domain.
    ///
    /// Mirrors attach in reverse: infrastructure is unrouted before the
    /// record is cleared, so a commit failure leaves the domain safely
    /// unrouted and a retry converges.
    pub async fn detach(&self, site: &str) -> ControlResult<DetachOutcome> {
        let record = self.require_site(site).await?;
        let Some(removed) = record.custom_domain.clone() else {
            return Err(ControlError::validation("no custom domain set"));
        };

        let kind = self.site_kind(&record).await;

        // A clean DOMAIN_ACTIVE site walks through DOMAIN_REMOVING; a
        // retry after a failed detach is already there.
        let walked = record.status == SiteStatus::DomainActive;
        if walked {
            self.store
                .transition_site(site, SiteStatus::DomainRemoving)
                .await?;
        }

        if let Err(e) = self
            .apply_routing(site, &record.domain, kind, Some(&removed), None)
            .await
        {
            // Status stays DOMAIN_REMOVING so the retry resumes here.
            return Err(e);
        }

        if kind == SiteKind::WordPress {
            if let Err(e) = self
                .app_db
                .update_site_urls(
                    &naming::app_database(site),
                    &format!("https://{}", record.domain),
                )
                .await
            {
                warn!(site = %site, error = %e, "application URL update failed, continuing");
            }
        }

        if let Err(e) = self.store.set_custom_domain(site, None).await {
            error!(
                site = %site,
                domain = %removed,
                error = %e,
                "CRITICAL: domain unrouted but commit failed"
            );
            return Err(ControlError::AppliedNotPersisted(
                "domain unrouted but failed to persist; retry the request".to_owned(),
            ));
        }

        if matches!(
            self.store
                .get_site(site)
                .await?
                .map(|s| s.status),
            Some(SiteStatus::DomainRemoving)
        ) {
            self.store.transition_site(site, SiteStatus::Active).await?;
        }

        info!(site = %site, domain = %removed, "custom domain removed");
        Ok(DetachOutcome {
            default_domain: record.domain,
            removed_domain: removed,
        })
    }

    /// Read-only probes for the domain-status endpoint.
    pub async fn status(&self, site: &str) -> ControlResult<DomainStatusReport> {
        let record = self.require_site(site).await?;
        let Some(domain) = record.custom_domain else {
            return Err(ControlError::validation("no custom domain set"));
        };

        let (dns_ok, resolved) = match self.dns.lookup_a(&domain).await {
            Ok(addrs) => (addrs.contains(&self.cfg.public_ip), addrs),
            Err(_) => (false, Vec::new()),
        };

        let cert_status = self.cert_poller.check(&domain).await;

        let step = if !dns_ok {
            DomainStep::PendingDns
        } else if cert_status == CertStatus::Pending {
            DomainStep::PendingCert
        } else {
            DomainStep::Active
        };

        Ok(DomainStatusReport {
            domain,
            expected_ip: self.cfg.public_ip,
            dns_ok,
            resolved,
            cert_status,
            ready: step == DomainStep::Active,
            step,
        })
    }

    /// Re-queue certificate issuance by reloading the edge router, then
    /// poll for the certificate up to the configured deadline.
    pub async fn cert_retry(&self, site: &str) -> ControlResult<(String, CertStatus)> {
        let record = self.require_site(site).await?;
        let Some(domain) = record.custom_domain else {
            return Err(ControlError::conflict("no custom domain set"));
        };

        self.edge.reload().await?;
        let status = self.cert_poller.poll(&domain, self.cert_timeout).await;
        Ok((domain, status))
    }

    async fn require_site(&self, site: &str) -> ControlResult<SiteRecord> {
        self.store
            .get_site(site)
            .await?
            .ok_or_else(|| ControlError::not_found("site not found"))
    }

    /// Derive the site kind from the job that provisioned it.
    async fn site_kind(&self, record: &SiteRecord) -> SiteKind {
        match self.store.get_job(&record.job_id).await {
            Ok(Some(job)) => SiteKind::from_job_kind(job.kind),
            _ => SiteKind::WordPress,
        }
    }

    async fn check_dns(&self, domain: &str) -> ControlResult<()> {
        let addrs = self
            .dns
            .lookup_a(domain)
            .await
            .map_err(|e| ControlError::validation(e.to_string()))?;

        if addrs.is_empty() {
            return Err(ControlError::validation(format!(
                "domain {domain} has no DNS records"
            )));
        }

        if !addrs.contains(&self.cfg.public_ip) {
            let resolved: Vec<String> = addrs.iter().map(ToString::to_string).collect();
            return Err(ControlError::validation(format!(
                "domain {domain} does not point to {} (resolved: {}); set an A record to {} first",
                self.cfg.public_ip,
                resolved.join(", "),
                self.cfg.public_ip,
            )));
        }

        Ok(())
    }

    /// Rewrite routing for the requested hostname set, compensating back
    /// to `previous` on partial failure.
    async fn apply_routing(
        &self,
        site: &str,
        default_domain: &str,
        kind: SiteKind,
        previous: Option<&str>,
        requested: Option<&str>,
    ) -> ControlResult<()> {
        // Step 1: sidecar server block (WordPress sites only).
        let sidecar_rewritten = if kind == SiteKind::WordPress {
            self.rewrite_sidecar(site, default_domain, requested).await?;
            true
        } else {
            false
        };

        // Step 2: edge snippet and reload, which triggers TLS issuance
        // for any new hostname in the background.
        if let Err(e) = self.rewrite_edge(site, kind, default_domain, requested).await {
            if sidecar_rewritten {
                self.best_effort_sidecar(site, default_domain, previous).await;
            }
            return Err(e);
        }

        // Step 3: tunnel ingress record.
        let tunnel_result = match requested {
            Some(domain) => self.tunnel.ensure_ingress(domain).await,
            None => match previous {
                Some(domain) => self.tunnel.remove_ingress(domain).await,
                None => Ok(()),
            },
        };
        if let Err(e) = tunnel_result {
            self.best_effort_edge(site, kind, default_domain, previous).await;
            if sidecar_rewritten {
                self.best_effort_sidecar(site, default_domain, previous).await;
            }
            return Err(e.into());
        }

        Ok(())
    }

    async fn rewrite_sidecar(
        &self,
        site: &str,
        default_domain: &str,
        custom: Option<&str>,
    ) -> ControlResult<()> {
        let sidecar = naming::sidecar_container(site);
        let block = render::sidecar_server_block(site, default_domain, custom);
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
        .await
    }

    async fn rewrite_edge(
        &self,
        site: &str,
        kind: SiteKind,
        default_domain: &str,
        custom: Option<&str>,
    ) -> ControlResult<()> {
        let snippet = match kind {
            SiteKind::WordPress => render::edge_snippet_wordpress(site, default_domain, custom),
            SiteKind::Static => render::edge_snippet_static(site, default_domain, custom),
        };
        self.edge
            .write_snippet(site, snippet.into_bytes().into())
            .await?;
        self.edge.reload().await?;
        Ok(())
    }

    async fn best_effort_sidecar(&self, site: &str, default_domain: &str, custom: Option<&str>) {
        if let Err(e) = self.rewrite_sidecar(site, default_domain, custom).await {
            warn!(site = %site, error = %e, "rollback: sidecar restore failed");
        }
    }

    async fn best_effort_edge(
        &self,
        site: &str,
        kind: SiteKind,
        default_domain: &str,
        custom: Option<&str>,
    ) {
        if let Err(e) = self.rewrite_edge(site, kind, default_domain, custom).await {
            warn!(site = %site, error = %e, "rollback: edge restore failed");
        }
    }

    async fn revert_to_active(&self, site: &str, staged: bool) {
        if !staged {
            return;
        }
        if let Err(e) = self.store.transition_site(site, SiteStatus::Active).await {
            warn!(site = %site, error = %e, "failed to return site to ACTIVE");
        }
    }
}

impl std::fmt::Debug for DomainManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainManager").finish_non_exhaustive()
    }
}
