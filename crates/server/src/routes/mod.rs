//! API route handlers for the qmd-hasher server.

pub mod download;
pub mod hash;
pub mod health;
pub mod jobs;
pub mod results;
pub mod status;
pub mod versions;

use std::sync::Arc;

use axum::Router;

use crate::state::AppState;

/// Create the combined API router with all routes under /api prefix.
///
/// Routes:
/// - GET    /api/health - Health check
/// - GET    /api/versions - Versions with device hashtabs
/// - POST   /api/hash - Submit a batch of .qmd files
/// - GET    /api/results/{job_id} - Poll a job
/// - GET    /api/status/stream/{job_id} - SSE stream of a job's status
/// - GET    /api/download/{job_id} - Hashed output (file or zip)
/// - DELETE /api/jobs/{job_id} - Purge a job and its outputs
pub fn api_routes(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .merge(health::router())
        .merge(versions::router())
        .merge(hash::router())
        .merge(results::router())
        .merge(status::router())
        .merge(download::router())
        .merge(jobs::router());

    Router::new().nest("/api", api).with_state(state)
}
