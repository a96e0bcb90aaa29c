// crates/server-jobs/src/types.rs
//! Types for the job registry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Lifecycle of a job: `pending → running* → success | error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Error,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Success,
    Error,
}

/// Outcome for one input file of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileResult {
    pub name: String,
    pub path: String,
    pub status: FileStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FileResult {
    pub fn success(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            status: FileStatus::Success,
            error: None,
        }
    }

    pub fn error(name: impl Into<String>, path: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            status: FileStatus::Error,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == FileStatus::Success
    }
}

/// One batch job. Values handed out by the store are snapshots; mutating
/// them has no effect on the stored job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub status: JobStatus,
    pub message: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub data: HashMap<String, String>,
    /// Percentage, always within 0..=100.
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    pub files: Vec<FileResult>,
    pub file_count: usize,
    #[serde(skip)]
    pub output_dir: Option<PathBuf>,
    #[serde(skip)]
    pub created_at: DateTime<Utc>,
    /// Set on the first transition into a terminal status, never again.
    #[serde(skip)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub(crate) fn new(now: DateTime<Utc>) -> Self {
        Self {
            status: JobStatus::Pending,
            message: "Job created".to_string(),
            data: HashMap::new(),
            progress: 0,
            operation: None,
            files: Vec::new(),
            file_count: 0,
            output_dir: None,
            created_at: now,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn successful_files(&self) -> impl Iterator<Item = &FileResult> {
        self.files.iter().filter(|f| f.is_success())
    }

    pub fn record(&self) -> JobRecord {
        JobRecord::from(self)
    }
}

/// Status record served to pollers and pushed to stream clients.
///
/// Per-file results are only included once the job is terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub status: JobStatus,
    pub message: String,
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    pub file_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<FileResult>>,
}

impl From<&Job> for JobRecord {
    fn from(job: &Job) -> Self {
        Self {
            status: job.status,
            message: job.message.clone(),
            progress: job.progress,
            operation: job.operation.clone(),
            file_count: job.file_count,
            files: job.is_terminal().then(|| job.files.clone()),
        }
    }
}
