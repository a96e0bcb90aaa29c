// crates/core/src/error.rs
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur when parsing a hashtab file
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Hashtab file not found: {path}")]
    NotFound { path: PathBuf },

    #[error("Permission denied reading hashtab: {path}")]
    PermissionDenied { path: PathBuf },

    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unrecognized hashtab header in {path}")]
    BadMagic { path: PathBuf },

    #[error("Truncated hashtab {path}: {context}")]
    Truncated { path: PathBuf, context: &'static str },

    #[error("Invalid UTF-8 in {field} of {path}")]
    InvalidUtf8 { path: PathBuf, field: &'static str },

    #[error("Empty {field} in hashtab {path}")]
    EmptyField { path: PathBuf, field: &'static str },
}

impl ParseError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound { path },
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            _ => Self::Io { path, source },
        }
    }
}

/// A field too long for its length prefix.
#[derive(Debug, Error)]
#[error("Hashtab {field} is {len} bytes, limit is {max}")]
pub struct EncodeError {
    pub field: &'static str,
    pub len: usize,
    pub max: usize,
}

/// Errors that make the hashtab registry unusable. Only surfaced at startup;
/// periodic reloads log these and keep the previous state.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Failed to walk hashtab directory {path}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("Failed to create hashtab directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors returned by the external hashing engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to spawn {binary}: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} failed (exit code {code:?})\nstderr: {stderr}\nstdout: {stdout}")]
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
        stdout: String,
    },
}

/// Errors that can occur while resolving a GCD hashtab
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("No hashtabs found for version {version}")]
    NotFound { version: String },

    #[error("qmldiff gcd-hashtab failed: {0}")]
    Derivation(#[from] EngineError),

    #[error("Failed to create GCD hashtab directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_io_classification() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = ParseError::io("/test/path", io_err);
        assert!(matches!(err, ParseError::NotFound { .. }));

        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err = ParseError::io("/test/path", io_err);
        assert!(matches!(err, ParseError::PermissionDenied { .. }));

        let io_err = std::io::Error::new(std::io::ErrorKind::TimedOut, "timeout");
        let err = ParseError::io("/test/path", io_err);
        assert!(matches!(err, ParseError::Io { .. }));
    }

    #[test]
    fn test_cache_error_display() {
        let err = CacheError::NotFound {
            version: "3.25.0.140".to_string(),
        };
        assert_eq!(err.to_string(), "No hashtabs found for version 3.25.0.140");
    }

    #[test]
    fn test_engine_error_carries_diagnostics() {
        let err = EngineError::Failed {
            command: "hash-diffs".to_string(),
            code: Some(2),
            stderr: "unknown hash 0xdead".to_string(),
            stdout: String::new(),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("hash-diffs failed"));
        assert!(msg.contains("unknown hash 0xdead"));

        let cache_err: CacheError = err.into();
        assert!(matches!(cache_err, CacheError::Derivation(_)));
    }
}
