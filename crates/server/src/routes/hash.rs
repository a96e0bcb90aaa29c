// crates/server/src/routes/hash.rs
//! Batch submission endpoint.
//!
//! - POST /hash - multipart upload of `.qmd` files plus a `version` field

use std::path::{Component, Path};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Multipart, State};
use axum::routing::post;
use axum::{Json, Router};
use serde::Serialize;

use crate::batch::{run_batch, BatchFile, BatchRequest};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct SubmitResponse {
    pub job_id: String,
}

struct Upload {
    file_name: String,
    bytes: Bytes,
}

/// POST /api/hash - stage the uploaded files and start a batch job.
///
/// Fields: `version` (required), then either repeated `files` with an
/// optional parallel list of `paths`, or a single `file`. Files that are
/// not `.qmd` or are empty are skipped.
pub async fn submit_hash(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> ApiResult<Json<SubmitResponse>> {
    let mut version = None;
    let mut files = Vec::new();
    let mut paths = Vec::new();
    let mut single = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "version" => version = Some(field.text().await?),
            "paths" => paths.push(field.text().await?),
            "files" | "file" => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                let upload = Upload {
                    file_name,
                    bytes: field.bytes().await?,
                };
                if name == "files" {
                    files.push(upload);
                } else {
                    single = Some(upload);
                }
            }
            _ => {}
        }
    }

    let version = version
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::BadRequest("version is required".to_string()))?;

    let uploads: Vec<(String, Bytes)> = if !files.is_empty() {
        files
            .into_iter()
            .enumerate()
            .map(|(i, upload)| {
                let path = paths
                    .get(i)
                    .filter(|p| !p.is_empty())
                    .cloned()
                    .unwrap_or(upload.file_name);
                (path, upload.bytes)
            })
            .collect()
    } else if let Some(upload) = single {
        vec![(upload.file_name, upload.bytes)]
    } else {
        return Err(ApiError::BadRequest("No file uploaded or invalid form data".to_string()));
    };

    let mut accepted = Vec::with_capacity(uploads.len());
    for (raw_path, bytes) in uploads {
        if !raw_path.to_ascii_lowercase().ends_with(".qmd") {
            tracing::debug!(path = %raw_path, "Skipping non-.qmd upload");
            continue;
        }
        let Some(rel_path) = sanitize_rel_path(&raw_path) else {
            tracing::warn!(path = %raw_path, "Path traversal attempt detected");
            return Err(ApiError::BadRequest(format!("Invalid file path: {raw_path}")));
        };
        if bytes.is_empty() {
            tracing::warn!(path = %rel_path, "Skipping empty file");
            continue;
        }
        accepted.push((rel_path, bytes));
    }
    if accepted.is_empty() {
        return Err(ApiError::BadRequest("No .qmd files uploaded".to_string()));
    }

    let input_dir = tempfile::Builder::new()
        .prefix("hash-input-")
        .tempdir()
        .map_err(|e| ApiError::Internal(format!("Failed to create input directory: {e}")))?;
    let output_dir = tempfile::Builder::new()
        .prefix("hash-output-")
        .tempdir()
        .map_err(|e| ApiError::Internal(format!("Failed to create output directory: {e}")))?;

    let mut batch_files = Vec::with_capacity(accepted.len());
    for (rel_path, bytes) in accepted {
        let input = input_dir.path().join(&rel_path);
        write_upload(&input, &bytes)
            .await
            .map_err(|e| ApiError::Internal(format!("Failed to save file {rel_path}: {e}")))?;
        batch_files.push(BatchFile { input, rel_path });
    }

    // From here the job owns the output directory.
    let output_dir = output_dir.keep();
    let job_id = uuid::Uuid::new_v4().to_string();
    state.jobs.create(&job_id);
    state.jobs.set_file_count(&job_id, batch_files.len());
    state.jobs.set_output_dir(&job_id, &output_dir);

    tracing::info!(
        job_id = %job_id,
        version = %version,
        files = batch_files.len(),
        "Received QMD files for hashing"
    );

    tokio::spawn(run_batch(
        state.clone(),
        BatchRequest {
            job_id: job_id.clone(),
            version,
            files: batch_files,
            input_dir,
            output_dir,
        },
    ));

    Ok(Json(SubmitResponse { job_id }))
}

async fn write_upload(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, bytes).await
}

/// Normalize a client-supplied relative path. `None` if it is absolute,
/// climbs out with `..`, or names nothing.
fn sanitize_rel_path(raw: &str) -> Option<String> {
    let unified = raw.replace('\\', "/");
    let mut parts = Vec::new();
    for component in Path::new(&unified).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// Build the hash router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/hash", post(submit_hash))
}
