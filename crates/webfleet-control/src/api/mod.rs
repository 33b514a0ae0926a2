//! HTTP API for the control plane.
//!
//! Every endpoint except the health check requires the shared API key in
//! the `X-API-Key` header. Handlers stay thin: validation and enqueueing
//! live in [`SiteService`], the synchronous domain transaction in
//! [`DomainManager`]; handlers translate [`ControlError`] kinds into
//! status codes.

mod domains;
mod jobs;
mod sites;

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Serialize;

use webfleet_state::StateError;

use crate::error::ControlError;
use crate::orchestrator::DomainManager;
use crate::probes::CertPoller;
use crate::service::SiteService;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<SiteService>,
    pub domains: Arc<DomainManager>,
    pub cert: Arc<CertPoller>,
    pub api_key: String,
    pub staging_dir: PathBuf,
}

/// Create the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/provision", post(sites::provision))
        .route("/api/static/provision", post(sites::static_provision))
        .route("/api/destroy", post(sites::destroy))
        .route("/api/sites", get(sites::list))
        .route("/api/sites/{site}", get(sites::get))
        .route("/api/sites/{site}", delete(sites::hard_delete))
        .route("/api/sites/{site}/domain", post(domains::attach))
        .route("/api/sites/{site}/domain", delete(domains::detach))
        .route("/api/sites/{site}/domain/status", get(domains::status))
        .route("/api/sites/{site}/cert-retry", post(domains::cert_retry))
        .route("/api/jobs/{id}", get(jobs::get))
        .route("/api/jobs/{id}", delete(jobs::hard_delete))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ))
        .with_state(state)
}

/// Error payload shared by every endpoint.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

/// An error plus the status code it maps to.
pub(crate) type ApiError = (StatusCode, Json<ErrorBody>);

pub(crate) fn error_response(error: ControlError) -> ApiError {
    let status = match &error {
        ControlError::Validation(_) => StatusCode::BAD_REQUEST,
        ControlError::NotFound(_) => StatusCode::NOT_FOUND,
        ControlError::Conflict(_) => StatusCode::CONFLICT,
        ControlError::State(state_error) => match state_error {
            StateError::SiteNotFound(_) | StateError::JobNotFound(_) => StatusCode::NOT_FOUND,
            StateError::InvalidTransition { .. }
            | StateError::DomainTaken { .. }
            | StateError::Conflict(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    (
        status,
        Json(ErrorBody {
            error: error.to_string(),
        }),
    )
}

/// `X-API-Key` check; the health endpoint stays open for probes.
async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if request.uri().path() == "/api/health" {
        return next.run(request).await;
    }

    let provided = request
        .headers()
        .get("x-api-key")
        .and_then(|value| value.to_str().ok());

    if provided == Some(state.api_key.as_str()) {
        next.run(request).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(ErrorBody {
                error: "unauthorized".to_owned(),
            }),
        )
            .into_response()
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}


#[cfg(test)]
mod tests {
    use super::testkit::harness;
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn health_is_open() {
        let app = router(harness().state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn everything_else_requires_the_key() {
        let app = router(harness().state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/sites")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn wrong_key_is_rejected() {
        let app = router(harness().state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/sites")
                    .header("X-API-Key", "wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn correct_key_passes() {
        let app = router(harness().state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/sites")
                    .header("X-API-Key", "secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }
}
