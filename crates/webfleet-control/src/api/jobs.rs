//! Job status and cleanup endpoints.

use axum::extract::{Path, State};
use axum::Json;
use serde::Serialize;
use tracing::info;

use webfleet_state::JobRecord;

use super::{error_response, ApiError, AppState};
use crate::api::sites::DeletedResponse;

/// One job row as exposed over the API.
#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub job_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub site: String,
    pub status: String,
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

impl From<JobRecord> for JobResponse {
    fn from(job: JobRecord) -> Self {
        Self {
            job_id: job.id,
            kind: job.kind.as_str().to_owned(),
            site: job.site,
            status: job.status.as_str().to_owned(),
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            error: job.error,
            created_at: job.created_at.to_rfc3339(),
            started_at: job.started_at.map(|t| t.to_rfc3339()),
            completed_at: job.completed_at.map(|t| t.to_rfc3339()),
        }
    }
}

/// `GET /api/jobs/{id}`
pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    let job = state.service.get_job(&id).await.map_err(error_response)?;
    Ok(Json(job.into()))
}

/// `DELETE /api/jobs/{id}`
pub async fn hard_delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeletedResponse>, ApiError> {
    state
        .service
        .hard_delete_job(&id)
        .await
        .map_err(error_response)?;

    info!(job = %id, "job hard-deleted");
    Ok(Json(DeletedResponse { deleted: id }))
}

#[cfg(test)]
mod tests {
    use super::super::testkit::harness;
    use super::super::router;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use tower::ServiceExt;

    use webfleet_state::{JobKind, StateStore};

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header("X-API-Key", "secret")
            .body(Body::empty())
            .unwrap()
    }

    fn delete(uri: &str) -> Request<Body> {
        Request::builder()
            .method("DELETE")
            .uri(uri)
            .header("X-API-Key", "secret")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn get_reports_queue_fields() {
        let harness = harness();
        harness
            .store
            .insert_job("j1", JobKind::Provision, "mysite")
            .await
            .unwrap();

        let app = router(harness.state);
        let response = app.oneshot(get("/api/jobs/j1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["job_id"], "j1");
        assert_eq!(body["type"], "PROVISION");
        assert_eq!(body["status"], "PENDING");
        assert_eq!(body["attempts"], 0);
        assert_eq!(body["max_attempts"], 3);
    }

    #[tokio::test]
    async fn unknown_job_is_404() {
        let harness = harness();
        let app = router(harness.state);

        let response = app.oneshot(get("/api/jobs/ghost")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn deleting_an_active_job_conflicts() {
        let harness = harness();
        harness
            .store
            .insert_job("j1", JobKind::Provision, "mysite")
            .await
            .unwrap();

        let app = router(harness.state.clone());
        let response = app.oneshot(delete("/api/jobs/j1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        // Finish the job, then deletion goes through.
        harness.store.claim_next_job().await.unwrap().unwrap();
        harness.store.fail_job("j1", "mysite", "done").await.unwrap();

        let app = router(harness.state);
        let response = app.oneshot(delete("/api/jobs/j1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
