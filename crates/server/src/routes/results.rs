// crates/server/src/routes/results.rs
//! Poll endpoint for batch jobs.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use qmd_hasher_jobs::JobRecord;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// GET /api/results/{job_id} - Current status record of a job.
///
/// 202 while the job is still pending or running, 200 once it has finished
/// (per-file results included).
pub async fn get_results(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> ApiResult<(StatusCode, Json<JobRecord>)> {
    let job = state
        .jobs
        .get(&job_id)
        .ok_or_else(|| ApiError::JobNotFound(job_id.clone()))?;

    let status = if job.is_terminal() {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(job.record())))
}

/// Create the results router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/results/{job_id}", get(get_results))
}
