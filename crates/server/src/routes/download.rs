// crates/server/src/routes/download.rs
//! Hashed output retrieval.
//!
//! - GET /download/{job_id} - the single hashed file, or a zip of all of them

use std::io::{Cursor, Write};
use std::path::Path as FsPath;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use qmd_hasher_jobs::{FileResult, JobStatus};
use zip::write::FileOptions;
use zip::CompressionMethod;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

const ZIP_NAME: &str = "hashed-files.zip";

/// GET /api/download/{job_id}
///
/// Only successful jobs can be downloaded. Failed files are left out; if
/// exactly one file succeeded it is sent as is.
pub async fn download(State(state): State<Arc<AppState>>, Path(job_id): Path<String>) -> ApiResult<Response> {
    let job = state
        .jobs
        .get(&job_id)
        .ok_or_else(|| ApiError::JobNotFound(job_id.clone()))?;

    if job.status != JobStatus::Success {
        return Err(ApiError::BadRequest("Job not complete or failed".to_string()));
    }
    let output_dir = job
        .output_dir
        .clone()
        .ok_or_else(|| ApiError::Internal("Output directory not available".to_string()))?;

    let files: Vec<FileResult> = job.successful_files().cloned().collect();
    if files.is_empty() {
        return Err(ApiError::BadRequest(
            "No successfully hashed files to download".to_string(),
        ));
    }

    if let [only] = files.as_slice() {
        let bytes = tokio::fs::read(output_dir.join(&only.path))
            .await
            .map_err(|e| ApiError::Internal(format!("Failed to read {}: {e}", only.path)))?;
        return Ok(attachment("application/octet-stream", &file_name(&only.name), bytes));
    }

    let count = files.len();
    let bytes = tokio::task::spawn_blocking(move || build_zip(&output_dir, &files))
        .await
        .map_err(|e| ApiError::Internal(format!("Zip task failed: {e}")))?
        .map_err(|e| ApiError::Internal(format!("Failed to build zip: {e}")))?;
    tracing::info!(job_id = %job_id, files = count, bytes = bytes.len(), "Serving zip download");
    Ok(attachment("application/zip", ZIP_NAME, bytes))
}

fn attachment(content_type: &'static str, name: &str, bytes: Vec<u8>) -> Response {
    let disposition = format!("attachment; filename=\"{}\"", name.replace(['"', '\\'], "_"));
    (
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response()
}

/// Last component of a client-supplied relative path.
fn file_name(name: &str) -> String {
    FsPath::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string())
}

/// Zip the given outputs, stored under their relative paths. Outputs that
/// cannot be read are logged and left out.
fn build_zip(output_dir: &FsPath, files: &[FileResult]) -> zip::result::ZipResult<Vec<u8>> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);

    for file in files {
        let data = match std::fs::read(output_dir.join(&file.path)) {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(path = %file.path, error = %e, "Failed to read output for zip");
                continue;
            }
        };
        writer.start_file(file.path.as_str(), options)?;
        writer.write_all(&data)?;
    }

    Ok(writer.finish()?.into_inner())
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/download/{job_id}", get(download))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::create_app;
    use crate::state::test_support::test_env;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use pretty_assertions::assert_eq;
    use std::io::Read;
    use tower::ServiceExt;

    async fn get(app: Router, uri: &str) -> (StatusCode, Option<String>, Vec<u8>) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let disposition = response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .map(|v| v.to_str().unwrap().to_string());
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, disposition, body.to_vec())
    }

    /// A finished job whose output dir holds the given successful files.
    fn finished_job(state: &AppState, dir: &FsPath, id: &str, ok: &[&str], failed: &[&str]) {
        state.jobs.create(id);
        state.jobs.set_output_dir(id, dir);
        for path in ok {
            let out = dir.join(path);
            std::fs::create_dir_all(out.parent().unwrap()).unwrap();
            std::fs::write(&out, format!("hashed {path}")).unwrap();
            state.jobs.add_file(id, FileResult::success(*path, *path));
        }
        for path in failed {
            state.jobs.add_file(id, FileResult::error(*path, *path, "Hashing failed: boom"));
        }
        let status = if ok.is_empty() { JobStatus::Error } else { JobStatus::Success };
        state.jobs.update(id, status, "done", None);
    }

    #[tokio::test]
    async fn test_single_file_is_sent_directly() {
        let env = test_env(&[]);
        let out = env.dir.path().join("out-1");
        finished_job(&env.state, &out, "job-1", &["ui/main.qmd"], &["ui/bad.qmd"]);

        let (status, disposition, body) = get(create_app(env.state.clone()), "/api/download/job-1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(disposition.as_deref(), Some("attachment; filename=\"main.qmd\""));
        assert_eq!(body, b"hashed ui/main.qmd");
    }

    #[tokio::test]
    async fn test_several_files_are_zipped() {
        let env = test_env(&[]);
        let out = env.dir.path().join("out-2");
        finished_job(&env.state, &out, "job-2", &["ui/main.qmd", "settings.qmd"], &["bad.qmd"]);

        let (status, disposition, body) = get(create_app(env.state.clone()), "/api/download/job-2").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(disposition.as_deref(), Some("attachment; filename=\"hashed-files.zip\""));

        let mut archive = zip::ZipArchive::new(Cursor::new(body)).unwrap();
        assert_eq!(archive.len(), 2);
        let mut content = String::new();
        archive
            .by_name("ui/main.qmd")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "hashed ui/main.qmd");
        assert!(archive.by_name("bad.qmd").is_err());
    }

    #[tokio::test]
    async fn test_unfinished_or_failed_job_is_400() {
        let env = test_env(&[]);
        env.state.jobs.create("running");
        env.state.jobs.update("running", JobStatus::Running, "Hashing files", None);
        let out = env.dir.path().join("out-3");
        finished_job(&env.state, &out, "failed", &[], &["a.qmd"]);

        let app = create_app(env.state.clone());
        let (status, _, body) = get(app.clone(), "/api/download/running").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["details"], "Job not complete or failed");

        let (status, _, _) = get(app.clone(), "/api/download/failed").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _, _) = get(app, "/api/download/missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_file_name_strips_directories() {
        assert_eq!(file_name("ui/components/Button.qmd"), "Button.qmd");
        assert_eq!(file_name("main.qmd"), "main.qmd");
    }
}
