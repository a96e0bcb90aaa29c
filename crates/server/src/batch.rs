// crates/server/src/batch.rs
//! Background processing of one uploaded batch of `.qmd` files.
//!
//! The task owns the job's progress: it resolves the GCD hashtab, rewrites
//! each file into the output directory and finishes the job. A failing file
//! is recorded and the batch moves on.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use qmd_hasher_core::HashEngine;
use qmd_hasher_jobs::{remove_output_dir, FileResult, JobStatus};
use tempfile::TempDir;

use crate::state::AppState;

/// One staged upload.
#[derive(Debug, Clone)]
pub struct BatchFile {
    /// Location of the uploaded copy inside the input directory.
    pub input: PathBuf,
    /// Client-supplied relative path, already validated.
    pub rel_path: String,
}

#[derive(Debug)]
pub struct BatchRequest {
    pub job_id: String,
    pub version: String,
    pub files: Vec<BatchFile>,
    /// Deleted when the batch ends, whatever the outcome.
    pub input_dir: TempDir,
    /// Kept on success; deleted when the batch fails as a whole.
    pub output_dir: PathBuf,
}

pub async fn run_batch(state: Arc<AppState>, request: BatchRequest) {
    let BatchRequest {
        job_id,
        version,
        files,
        input_dir,
        output_dir,
    } = request;
    let jobs = &state.jobs;
    let id = job_id.as_str();

    jobs.update_with_operation(id, JobStatus::Running, "Getting GCD hashtab", None, "preparing");

    let gcd_path = match state.gcd.get_or_refresh(&version).await {
        Ok(path) => path,
        Err(e) => {
            tracing::error!(job_id = id, version = %version, error = %e, "Failed to get GCD hashtab");
            jobs.update(id, JobStatus::Error, format!("Version {version} not available: {e}"), None);
            remove_output_dir(&output_dir).await;
            close_input_dir(input_dir);
            return;
        }
    };

    jobs.update_with_operation(id, JobStatus::Running, "Hashing files", None, "hashing");

    let total = files.len();
    let mut succeeded = 0;
    for (i, file) in files.iter().enumerate() {
        let output = output_dir.join(&file.rel_path);
        let result = match hash_file(state.engine.as_ref(), &gcd_path, &file.input, &output).await {
            Ok(()) => {
                succeeded += 1;
                FileResult::success(&file.rel_path, &file.rel_path)
            }
            Err(message) => {
                tracing::error!(job_id = id, file = %file.rel_path, error = %message, "Failed to hash file");
                FileResult::error(&file.rel_path, &file.rel_path, message)
            }
        };
        jobs.add_file(id, result);
        jobs.update_progress(id, ((i + 1) * 100 / total.max(1)) as i64);
    }

    if succeeded == 0 {
        jobs.update(id, JobStatus::Error, "All files failed to hash", None);
        remove_output_dir(&output_dir).await;
    } else {
        tracing::info!(job_id = id, version = %version, succeeded, total, "Hashing complete");
        jobs.update(id, JobStatus::Success, format!("Hashed {succeeded} file(s)"), None);
    }
    close_input_dir(input_dir);
}

/// Copy `input` to `output` and rewrite the copy in place. On failure the
/// error text for the file result is returned and no output is left behind.
async fn hash_file(engine: &dyn HashEngine, gcd_path: &Path, input: &Path, output: &Path) -> Result<(), String> {
    if let Err(e) = copy_file(input, output).await {
        return Err(format!("Failed to copy file: {e}"));
    }
    if let Err(e) = engine.hash_diffs(gcd_path, output).await {
        if let Err(rm) = tokio::fs::remove_file(output).await {
            tracing::warn!(path = %output.display(), error = %rm, "Failed to remove partial output");
        }
        return Err(format!("Hashing failed: {e}"));
    }
    Ok(())
}

async fn copy_file(input: &Path, output: &Path) -> std::io::Result<()> {
    if let Some(parent) = output.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::copy(input, output).await?;
    Ok(())
}

fn close_input_dir(dir: TempDir) {
    let path = dir.path().to_path_buf();
    if let Err(e) = dir.close() {
        tracing::warn!(path = %path.display(), error = %e, "Failed to remove input directory");
    }
}
