// crates/server/src/state.rs
//! Application state for the Axum server.

use std::sync::Arc;
use std::time::Instant;

use qmd_hasher_core::{GcdCache, HashEngine};
use qmd_hasher_jobs::JobStore;

use crate::config::Config;

/// Shared application state accessible from all route handlers and batch
/// tasks.
pub struct AppState {
    /// Server start time for uptime tracking.
    pub start_time: Instant,
    pub config: Config,
    /// GCD hashtab cache; owns the source registry.
    pub gcd: Arc<GcdCache>,
    /// Engine used to rewrite uploaded files.
    pub engine: Arc<dyn HashEngine>,
    pub jobs: Arc<JobStore>,
}

impl AppState {
    pub fn new(
        config: Config,
        gcd: Arc<GcdCache>,
        engine: Arc<dyn HashEngine>,
        jobs: Arc<JobStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            start_time: Instant::now(),
            config,
            gcd,
            engine,
            jobs,
        })
    }

    /// Get the server uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
