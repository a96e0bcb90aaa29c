// crates/server/src/routes/health.rs
//! Liveness plus a summary of what the service has loaded.

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    /// OS versions with at least one device hashtab.
    pub hashtab_versions: usize,
    pub hashtabs: usize,
    /// Jobs currently retained, finished or not.
    pub jobs: usize,
}

/// GET /api/health
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let registry = state.gcd.registry();
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.uptime_secs(),
        hashtab_versions: registry.versions().len(),
        hashtabs: registry.hashtabs().len(),
        jobs: state.jobs.len(),
    })
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(health_check))
}
