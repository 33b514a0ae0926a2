//! Custom-domain endpoints.

use std::net::Ipv4Addr;

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::orchestrator::DomainStep;
use crate::probes::CertStatus;

use super::{error_response, ApiError, AppState};

#[derive(Debug, Deserialize)]
pub struct AttachRequest {
    pub domain: String,
}

#[derive(Debug, Serialize)]
pub struct AttachResponse {
    pub site: String,
    pub default_domain: String,
    pub custom_domain: String,
    pub status: String,
    pub cert_status: CertStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct DetachResponse {
    pub site: String,
    pub domain: String,
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct DnsBlock {
    pub ok: bool,
    pub resolved: Vec<Ipv4Addr>,
}

#[derive(Debug, Serialize)]
pub struct DomainStatusResponse {
    pub domain: String,
    pub expected_ip: Ipv4Addr,
    pub dns: DnsBlock,
    pub cert_status: CertStatus,
    pub ready: bool,
    pub step: DomainStep,
}

#[derive(Debug, Serialize)]
pub struct CertRetryResponse {
    pub site: String,
    pub domain: String,
    pub cert_status: CertStatus,
}

/// `POST /api/sites/{site}/domain`
pub async fn attach(
    State(state): State<AppState>,
    Path(site): Path<String>,
    Json(request): Json<AttachRequest>,
) -> Result<Json<AttachResponse>, ApiError> {
    let outcome = state
        .domains
        .attach(&site, &request.domain)
        .await
        .map_err(error_response)?;

    let cert_status = state.cert.check(&outcome.custom_domain).await;

    Ok(Json(AttachResponse {
        site,
        default_domain: outcome.default_domain,
        custom_domain: outcome.custom_domain,
        status: outcome.status.as_str().to_owned(),
        cert_status,
        message: outcome.already_set.then_some("domain already set"),
    }))
}

/// `DELETE /api/sites/{site}/domain`
pub async fn detach(
    State(state): State<AppState>,
    Path(site): Path<String>,
) -> Result<Json<DetachResponse>, ApiError> {
    let outcome = state.domains.detach(&site).await.map_err(error_response)?;

    Ok(Json(DetachResponse {
        site,
        domain: outcome.default_domain,
        status: "custom domain removed",
    }))
}

/// `GET /api/sites/{site}/domain/status`
pub async fn status(
    State(state): State<AppState>,
    Path(site): Path<String>,
) -> Result<Json<DomainStatusResponse>, ApiError> {
    let report = state.domains.status(&site).await.map_err(error_response)?;

    Ok(Json(DomainStatusResponse {
        domain: report.domain,
        expected_ip: report.expected_ip,
        dns: DnsBlock {
            ok: report.dns_ok,
            resolved: report.resolved,
        },
        cert_status: report.cert_status,
        ready: report.ready,
        step: report.step,
    }))
}

/// `POST /api/sites/{site}/cert-retry`
pub async fn cert_retry(
    State(state): State<AppState>,
    Path(site): Path<String>,
) -> Result<Json<CertRetryResponse>, ApiError> {
    let (domain, cert_status) = state
        .domains
        .cert_retry(&site)
        .await
        .map_err(error_response)?;

    Ok(Json(CertRetryResponse {
        site,
        domain,
        cert_status,
    }))
}
