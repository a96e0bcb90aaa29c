// crates/server/src/routes/versions.rs
//! Lists the OS versions that have device hashtabs.

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use qmd_hasher_core::VersionInfo;
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct VersionsResponse {
    pub versions: Vec<VersionInfo>,
    pub count: usize,
}

/// GET /api/versions - Known versions, newest first, with their devices.
pub async fn list_versions(State(state): State<Arc<AppState>>) -> Json<VersionsResponse> {
    let versions = state.gcd.versions();
    Json(VersionsResponse {
        count: versions.len(),
        versions,
    })
}

/// Create the versions router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/versions", get(list_versions))
}
