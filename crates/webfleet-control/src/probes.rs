//! Live infrastructure probes and certificate polling.
//!
//! Probes reconcile durable state with what is actually deployed: they
//! never mutate anything, and a probe that cannot be answered becomes a
//! warning rather than an error, because drift reporting must not take
//! the read path down.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{sleep, Instant};

use webfleet_infra::EdgeConfigOps;

/// Whether the edge router holds an issued certificate for a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CertStatus {
    Issued,
    Pending,
}

/// Polls the edge router's certificate storage.
///
/// Issuance happens in the background after a reload; the poller checks
/// on a fixed tick until the certificate appears or the caller's deadline
/// passes. `Pending` is not an error; the router keeps retrying on its
/// own. The tick is injected so tests control time.
pub struct CertPoller {
    edge: Arc<dyn EdgeConfigOps>,
    tick: Duration,
}

/// Default certificate poll tick.
pub const DEFAULT_CERT_TICK: Duration = Duration::from_secs(3);

/// Default overall certificate poll deadline.
pub const DEFAULT_CERT_TIMEOUT: Duration = Duration::from_secs(30);

impl CertPoller {
    /// Create a poller with the default 3-second tick.
    pub fn new(edge: Arc<dyn EdgeConfigOps>) -> Self {
        Self::with_tick(edge, DEFAULT_CERT_TICK)
    }

    /// Create a poller with a custom tick.
    pub fn with_tick(edge: Arc<dyn EdgeConfigOps>, tick: Duration) -> Self {
        Self { edge, tick }
    }

    /// One-shot certificate check; probe failures count as pending.
    pub async fn check(&self, domain: &str) -> CertStatus {
        match self.edge.cert_on_disk(domain).await {
            Ok(true) => CertStatus::Issued,
            Ok(false) | Err(_) => CertStatus::Pending,
        }
    }

    /// Poll until the certificate is issued or `timeout` elapses.
    pub async fn poll(&self, domain: &str, timeout: Duration) -> CertStatus {
        let deadline = Instant::now() + timeout;
        loop {
            if self.check(domain).await == CertStatus::Issued {
                return CertStatus::Issued;
            }
            if Instant::now() + self.tick > deadline {
                return CertStatus::Pending;
            }
            sleep(self.tick).await;
        }
    }
}

impl std::fmt::Debug for CertPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertPoller")
            .field("tick", &self.tick)
            .finish_non_exhaustive()
    }
}

/// Results of the live probes attached to a site read.
#[derive(Debug, Clone, Serialize)]
pub struct SiteProbes {
    /// Certificate state for the site's active domain.
    pub cert_status: CertStatus,
    /// Whether the site's edge snippet exists.
    pub snippet_exists: bool,
    /// Whether the snippet routes the active domain.
    pub snippet_routes_domain: bool,
    /// Human-readable drift warnings; empty when everything matches.
    pub warnings: Vec<String>,
}

/// Probe live infrastructure for a site that should be serving traffic.
pub async fn probe_site(
    edge: &Arc<dyn EdgeConfigOps>,
    site: &str,
    active_domain: &str,
) -> SiteProbes {
    let mut warnings = Vec::new();

    let cert_status = match edge.cert_on_disk(active_domain).await {
        Ok(true) => CertStatus::Issued,
        Ok(false) => {
            warnings.push(format!(
                "no certificate on disk for {active_domain}; issuance may still be in progress"
            ));
            CertStatus::Pending
        }
        Err(e) => {
            warnings.push(format!("certificate probe failed: {e}"));
            CertStatus::Pending
        }
    };

    let snippet_exists = match edge.snippet_exists(site).await {
        Ok(true) => true,
        Ok(false) => {
            warnings.push(format!("edge snippet for {site} is missing"));
            false
        }
        Err(e) => {
            warnings.push(format!("snippet probe failed: {e}"));
            false
        }
    };

    let snippet_routes_domain = if snippet_exists {
        match edge.snippet_contains(site, active_domain).await {
            Ok(true) => true,
            Ok(false) => {
                warnings.push(format!(
                    "edge snippet for {site} does not route {active_domain}"
                ));
                false
            }
            Err(e) => {
                warnings.push(format!("snippet content probe failed: {e}"));
                false
            }
        }
    } else {
        false
    };

    SiteProbes {
        cert_status,
        snippet_exists,
        snippet_routes_domain,
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use webfleet_infra::mock::MockEdge;

    #[tokio::test]
    async fn healthy_site_has_no_warnings() {
        let edge = Arc::new(MockEdge::new());
        edge.write_snippet("mysite", Bytes::from_static(b"mysite.hosto.com {}"))
            .await
            .unwrap();
        edge.issue_cert("mysite.hosto.com");

        let edge_dyn: Arc<dyn EdgeConfigOps> = edge;
        let probes = probe_site(&edge_dyn, "mysite", "mysite.hosto.com").await;

        assert_eq!(probes.cert_status, CertStatus::Issued);
        assert!(probes.snippet_exists);
        assert!(probes.snippet_routes_domain);
        assert!(probes.warnings.is_empty());
    }

    #[tokio::test]
    async fn drift_produces_warnings() {
        let edge = Arc::new(MockEdge::new());
        edge.write_snippet("mysite", Bytes::from_static(b"other.hosto.com {}"))
            .await
            .unwrap();

        let edge_dyn: Arc<dyn EdgeConfigOps> = edge;
        let probes = probe_site(&edge_dyn, "mysite", "mysite.hosto.com").await;

        assert_eq!(probes.cert_status, CertStatus::Pending);
        assert!(probes.snippet_exists);
        assert!(!probes.snippet_routes_domain);
        assert_eq!(probes.warnings.len(), 2);
    }

    #[tokio::test]
    async fn missing_snippet_skips_the_content_probe() {
        let edge = Arc::new(MockEdge::new());
        let edge_dyn: Arc<dyn EdgeConfigOps> = edge;
        let probes = probe_site(&edge_dyn, "mysite", "mysite.hosto.com").await;

        assert!(!probes.snippet_exists);
        assert!(!probes.snippet_routes_domain);
        assert_eq!(probes.warnings.len(), 2);
    }

    #[tokio::test]
    async fn poll_returns_as_soon_as_issued() {
        let edge = Arc::new(MockEdge::new());
        edge.issue_cert("example.com");

        let poller = CertPoller::with_tick(
            Arc::clone(&edge) as Arc<dyn EdgeConfigOps>,
            Duration::from_millis(5),
        );
        let status = poller.poll("example.com", Duration::from_secs(1)).await;
        assert_eq!(status, CertStatus::Issued);
    }

    #[tokio::test]
    async fn poll_times_out_to_pending() {
        let edge = Arc::new(MockEdge::new());
        let poller = CertPoller::with_tick(
            edge as Arc<dyn EdgeConfigOps>,
            Duration::from_millis(5),
        );

        let status = poller.poll("example.com", Duration::from_millis(20)).await;
        assert_eq!(status, CertStatus::Pending);
    }
}
