// crates/server/src/config.rs
//! Startup configuration, read once from the environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default port for the server.
pub const DEFAULT_PORT: u16 = 8080;

const DEFAULT_MAX_UPLOAD_BYTES: usize = 100 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the device hashtabs (`HASHTAB_DIR`).
    pub hashtab_dir: PathBuf,
    /// Root of the merged GCD hashtabs (`GCD_HASHTAB_DIR`).
    pub gcd_dir: PathBuf,
    /// qmldiff executable (`QMLDIFF_BINARY`).
    pub qmldiff_binary: PathBuf,
    pub port: u16,
    pub reload_interval: Duration,
    pub job_retention: Duration,
    pub job_sweep_interval: Duration,
    pub subscriber_capacity: usize,
    pub max_upload_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hashtab_dir: PathBuf::from("./hashtables"),
            gcd_dir: PathBuf::from("./gcd-hashtabs"),
            qmldiff_binary: PathBuf::from("./qmldiff"),
            port: DEFAULT_PORT,
            reload_interval: Duration::from_secs(5),
            job_retention: Duration::from_secs(600),
            job_sweep_interval: Duration::from_secs(60),
            subscriber_capacity: 10,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Unset or empty variables keep
    /// their defaults; malformed numbers are logged and ignored.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let d = Self::default();

        Self {
            hashtab_dir: get("HASHTAB_DIR").map(PathBuf::from).unwrap_or(d.hashtab_dir),
            gcd_dir: get("GCD_HASHTAB_DIR").map(PathBuf::from).unwrap_or(d.gcd_dir),
            qmldiff_binary: get("QMLDIFF_BINARY").map(PathBuf::from).unwrap_or(d.qmldiff_binary),
            port: parse_or(get("PORT"), "PORT", d.port),
            reload_interval: secs_or(get("RELOAD_INTERVAL_SECS"), "RELOAD_INTERVAL_SECS", d.reload_interval),
            job_retention: secs_or(get("JOB_RETENTION_SECS"), "JOB_RETENTION_SECS", d.job_retention),
            job_sweep_interval: secs_or(
                get("JOB_SWEEP_INTERVAL_SECS"),
                "JOB_SWEEP_INTERVAL_SECS",
                d.job_sweep_interval,
            ),
            subscriber_capacity: parse_or(get("SUBSCRIBER_CAPACITY"), "SUBSCRIBER_CAPACITY", d.subscriber_capacity),
            max_upload_bytes: parse_or(get("MAX_UPLOAD_BYTES"), "MAX_UPLOAD_BYTES", d.max_upload_bytes),
        }
    }
}

fn parse_or<T>(raw: Option<String>, key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Display,
{
    let Some(raw) = raw else {
        return default;
    };
    match raw.trim().parse() {
        Ok(v) => v,
        Err(_) => {
            tracing::warn!(key, value = %raw, default = %default, "Invalid value, using default");
            default
        }
    }
}

fn secs_or(raw: Option<String>, key: &str, default: Duration) -> Duration {
    Duration::from_secs(parse_or(raw, key, default.as_secs()))
}
