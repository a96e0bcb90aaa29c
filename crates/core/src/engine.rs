// crates/core/src/engine.rs
//! The external hashing engine.
//!
//! Both operations are delegated to the `qmldiff` binary; this crate never
//! interprets hashtab contents beyond the descriptor.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use crate::error::EngineError;

/// Merge and rewrite operations of the hashing engine.
///
/// Implementations must be deterministic for identical inputs and must not
/// leave a usable output behind on failure.
#[async_trait]
pub trait HashEngine: Send + Sync {
    /// Merge several device hashtabs into the single GCD hashtab at `output`.
    async fn merge_hashtabs(&self, output: &Path, inputs: &[PathBuf]) -> Result<(), EngineError>;

    /// Rewrite `target` in place, replacing identifiers with hashes from `hashtab`.
    async fn hash_diffs(&self, hashtab: &Path, target: &Path) -> Result<(), EngineError>;

    /// Engine name for logging.
    fn name(&self) -> &str;
}

/// Engine backed by the `qmldiff` CLI.
#[derive(Debug, Clone)]
pub struct QmldiffEngine {
    binary: PathBuf,
}

impl QmldiffEngine {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    async fn run(&self, subcommand: &str, args: &[&Path]) -> Result<(), EngineError> {
        let t0 = std::time::Instant::now();
        tracing::debug!(
            binary = %self.binary.display(),
            subcommand,
            args = ?args,
            "qmldiff: running"
        );

        let output = Command::new(&self.binary)
            .arg(subcommand)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| {
                tracing::error!(binary = %self.binary.display(), error = %source, "qmldiff: failed to spawn");
                EngineError::Spawn {
                    binary: self.binary.clone(),
                    source,
                }
            })?;

        let elapsed_ms = t0.elapsed().as_millis() as u64;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
            tracing::warn!(elapsed_ms, subcommand, exit_code = ?output.status.code(), "qmldiff: non-zero exit");
            return Err(EngineError::Failed {
                command: subcommand.to_string(),
                code: output.status.code(),
                stderr,
                stdout,
            });
        }

        tracing::debug!(elapsed_ms, subcommand, "qmldiff: done");
        Ok(())
    }
}

#[async_trait]
impl HashEngine for QmldiffEngine {
    async fn merge_hashtabs(&self, output: &Path, inputs: &[PathBuf]) -> Result<(), EngineError> {
        let mut args: Vec<&Path> = Vec::with_capacity(inputs.len() + 1);
        args.push(output);
        args.extend(inputs.iter().map(PathBuf::as_path));
        self.run("gcd-hashtab", &args).await
    }

    async fn hash_diffs(&self, hashtab: &Path, target: &Path) -> Result<(), EngineError> {
        self.run("hash-diffs", &[hashtab, target]).await
    }

    fn name(&self) -> &str {
        "qmldiff"
    }
}
