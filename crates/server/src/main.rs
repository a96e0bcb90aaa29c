// crates/server/src/main.rs
//! qmd-hasher server binary.
//!
//! Loads the device hashtabs, pre-builds the GCD hashtab of every known
//! version, then serves the API until Ctrl-C or SIGTERM.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use qmd_hasher_core::{GcdCache, QmldiffEngine, SourceRegistry};
use qmd_hasher_jobs::{JobStore, JobStoreConfig};
use qmd_hasher_server::{create_app, AppState, Config};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "warn,qmd_hasher_core=info,qmd_hasher_jobs=info,qmd_hasher_server=info";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()))
        .init();

    let config = Config::from_env();
    tracing::info!(
        hashtab_dir = %config.hashtab_dir.display(),
        gcd_dir = %config.gcd_dir.display(),
        qmldiff = %config.qmldiff_binary.display(),
        "Starting qmd-hasher v{}",
        env!("CARGO_PKG_VERSION")
    );

    // Step 1: Index the device hashtabs. A walk failure here is fatal.
    let registry = SourceRegistry::open(&config.hashtab_dir, config.reload_interval)
        .context("Failed to load hashtabs")?;
    let registry = Arc::new(registry);

    // Step 2: Engine and GCD cache, warmed for every known version.
    let engine = Arc::new(QmldiffEngine::new(&config.qmldiff_binary));
    let gcd = GcdCache::new(&config.gcd_dir, registry.clone(), engine.clone())
        .context("Failed to initialize GCD hashtab cache")?;
    let gcd = Arc::new(gcd);
    let generated = gcd.generate_all().await;
    tracing::info!(
        generated,
        versions = registry.versions().len(),
        hashtabs = registry.hashtabs().len(),
        "GCD hashtabs ready"
    );

    // Step 3: Job store and its retention sweeper.
    let jobs = JobStore::new(JobStoreConfig {
        retention: config.job_retention,
        sweep_interval: config.job_sweep_interval,
        subscriber_capacity: config.subscriber_capacity,
    });
    let sweeper = jobs.spawn_sweeper();

    // Step 4: Serve.
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let state = AppState::new(config, gcd, engine, jobs);
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!("Listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sweeper.abort();
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
