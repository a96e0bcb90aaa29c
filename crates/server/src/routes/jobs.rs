// crates/server/src/routes/jobs.rs
//! Explicit job purge.
//!
//! - DELETE /jobs/{job_id} - drop the job, close its streams, delete its outputs

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::delete;
use axum::Router;
use qmd_hasher_jobs::remove_output_dir;
use std::sync::Arc;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// DELETE /api/jobs/{job_id}
async fn delete_job(State(state): State<Arc<AppState>>, Path(job_id): Path<String>) -> ApiResult<StatusCode> {
    let job = state
        .jobs
        .cleanup(&job_id)
        .ok_or_else(|| ApiError::JobNotFound(job_id.clone()))?;

    if let Some(dir) = &job.output_dir {
        remove_output_dir(dir).await;
    }
    tracing::info!(job_id = %job_id, status = %job.status, "Job deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// Build the jobs router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/jobs/{job_id}", delete(delete_job))
}
