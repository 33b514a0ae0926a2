//! Site provisioning, destruction, and read endpoints.

use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;

use webfleet_core::lifecycle;
use webfleet_state::SiteRecord;

use crate::error::ControlError;
use crate::probes::CertStatus;
use crate::service::SiteDetail;

use super::{error_response, ApiError, AppState};

#[derive(Debug, Deserialize)]
pub struct SiteRequest {
    pub site: String,
}

/// Response for a freshly queued job.
#[derive(Debug, Serialize)]
pub struct EnqueuedResponse {
    pub job_id: String,
    pub site: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    pub status: &'static str,
}

/// One site row as exposed over the API.
#[derive(Debug, Serialize)]
pub struct SiteResponse {
    pub site: String,
    pub domain: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_domain: Option<String>,
    pub status: String,
    pub job_id: String,
    pub created_at: String,
    pub updated_at: String,
}

impl From<SiteRecord> for SiteResponse {
    fn from(record: SiteRecord) -> Self {
        Self {
            site: record.site,
            domain: record.domain,
            custom_domain: record.custom_domain,
            status: record.status.as_str().to_owned(),
            job_id: record.job_id,
            created_at: record.created_at.to_rfc3339(),
            updated_at: record.updated_at.to_rfc3339(),
        }
    }
}

/// Site detail with the live probe block attached when present.
#[derive(Debug, Serialize)]
pub struct SiteDetailResponse {
    #[serde(flatten)]
    pub site: SiteResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_status: Option<CertStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet_exists: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet_routes_domain: Option<bool>,
    pub warnings: Vec<String>,
}

impl From<SiteDetail> for SiteDetailResponse {
    fn from(detail: SiteDetail) -> Self {
        let (cert_status, snippet_exists, snippet_routes_domain, warnings) = match detail.probes {
            Some(probes) => (
                Some(probes.cert_status),
                Some(probes.snippet_exists),
                Some(probes.snippet_routes_domain),
                probes.warnings,
            ),
            None => (None, None, None, Vec::new()),
        };

        Self {
            site: detail.record.into(),
            cert_status,
            snippet_exists,
            snippet_routes_domain,
            warnings,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SiteListResponse {
    pub sites: Vec<SiteResponse>,
}

#[derive(Debug, Serialize)]
pub struct DeletedResponse {
    pub deleted: String,
}

/// `POST /api/provision`
pub async fn provision(
    State(state): State<AppState>,
    Json(request): Json<SiteRequest>,
) -> Result<(StatusCode, Json<EnqueuedResponse>), ApiError> {
    let enqueued = state
        .service
        .enqueue_provision(&request.site)
        .await
        .map_err(error_response)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueuedResponse {
            job_id: enqueued.job_id,
            site: enqueued.site,
            domain: Some(enqueued.domain),
            status: "PENDING",
        }),
    ))
}

/// `POST /api/static/provision` (multipart: `site`, `zip`)
pub async fn static_provision(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<EnqueuedResponse>), ApiError> {
    let mut site = None;
    let mut archive = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        error_response(ControlError::validation(format!("malformed upload: {e}")))
    })? {
        match field.name() {
            Some("site") => {
                site = Some(field.text().await.map_err(|e| {
                    error_response(ControlError::validation(format!("malformed upload: {e}")))
                })?);
            }
            Some("zip") => {
                archive = Some(field.bytes().await.map_err(|e| {
                    error_response(ControlError::validation(format!("malformed upload: {e}")))
                })?);
            }
            _ => {}
        }
    }

    let site = site
        .map(|s| s.trim().to_lowercase())
        .ok_or_else(|| error_response(ControlError::validation("site is required")))?;
    lifecycle::validate_site_name(&site)
        .map_err(|e| error_response(ControlError::from(e)))?;
    let archive =
        archive.ok_or_else(|| error_response(ControlError::validation("zip file is required")))?;

    // Stage the upload so the worker can find it via the job payload.
    tokio::fs::create_dir_all(&state.staging_dir)
        .await
        .map_err(|e| {
            error_response(ControlError::internal(format!("staging dir: {e}")))
        })?;
    let staged = state.staging_dir.join(format!("{site}.zip"));
    tokio::fs::write(&staged, &archive).await.map_err(|e| {
        error_response(ControlError::internal(format!("failed to stage upload: {e}")))
    })?;

    info!(site = %site, bytes = archive.len(), path = %staged.display(), "upload staged");

    let staged_str = staged.to_string_lossy().into_owned();
    let enqueued = state
        .service
        .enqueue_static_provision(&site, &staged_str)
        .await
        .map_err(error_response)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueuedResponse {
            job_id: enqueued.job_id,
            site: enqueued.site,
            domain: Some(enqueued.domain),
            status: "PENDING",
        }),
    ))
}

/// `POST /api/destroy`
pub async fn destroy(
    State(state): State<AppState>,
    Json(request): Json<SiteRequest>,
) -> Result<(StatusCode, Json<EnqueuedResponse>), ApiError> {
    let enqueued = state
        .service
        .enqueue_destroy(&request.site)
        .await
        .map_err(error_response)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(EnqueuedResponse {
            job_id: enqueued.job_id,
            site: enqueued.site,
            domain: None,
            status: "PENDING",
        }),
    ))
}

/// `GET /api/sites`
pub async fn list(
    State(state): State<AppState>,
) -> Result<Json<SiteListResponse>, ApiError> {
    let sites = state.service.list_sites().await.map_err(error_response)?;

    Ok(Json(SiteListResponse {
        sites: sites.into_iter().map(SiteResponse::from).collect(),
    }))
}

/// `GET /api/sites/{site}`
pub async fn get(
    State(state): State<AppState>,
    Path(site): Path<String>,
) -> Result<Json<SiteDetailResponse>, ApiError> {
    let detail = state.service.get_site(&site).await.map_err(error_response)?;
    Ok(Json(detail.into()))
}

/// `DELETE /api/sites/{site}`
pub async fn hard_delete(
    State(state): State<AppState>,
    Path(site): Path<String>,
) -> Result<Json<DeletedResponse>, ApiError> {
    state
        .service
        .hard_delete_site(&site)
        .await
        .map_err(error_response)?;

    info!(site = %site, "site hard-deleted");
    Ok(Json(DeletedResponse { deleted: site }))
}
