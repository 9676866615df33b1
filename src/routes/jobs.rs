use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;
use crate::models::batch::Batch;
use crate::models::job::{JobSnapshot, JobStatus};
use crate::services::storage::ObjectStore;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadResponse {
    pub job_id: String,
    pub url: String,
    pub expires_in_secs: u64,
}

/// GET /api/v1/jobs/{job_id} — current state of one job.
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobSnapshot>, StatusCode> {
    let job = state
        .store
        .get_job(&job_id)
        .await
        .map_err(|e| {
            tracing::error!(job_id = %job_id, error = %e, "Failed to load job");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(JobSnapshot::from(&job)))
}

/// GET /api/v1/jobs/{job_id}/download — time-boxed URL to the processed photo.
pub async fn get_download_url(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<DownloadResponse>, StatusCode> {
    let job = state
        .store
        .get_job(&job_id)
        .await
        .map_err(|e| {
            tracing::error!(job_id = %job_id, error = %e, "Failed to load job");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;

    if job.status != JobStatus::Completed {
        return Err(StatusCode::CONFLICT);
    }

    let url = state
        .storage
        .presign_download(&job_id, state.presign_ttl)
        .await
        .map_err(|e| {
            tracing::error!(job_id = %job_id, error = %e, "Failed to presign download");
            StatusCode::BAD_GATEWAY
        })?
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(DownloadResponse {
        job_id,
        url,
        expires_in_secs: state.presign_ttl.as_secs(),
    }))
}

/// GET /api/v1/batches/{batch_id} — batch counters and derived status.
pub async fn get_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<String>,
) -> Result<Json<Batch>, StatusCode> {
    state
        .store
        .get_batch(&batch_id)
        .await
        .map_err(|e| {
            tracing::error!(batch_id = %batch_id, error = %e, "Failed to load batch");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}
