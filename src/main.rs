//! Flowtrace ingestion daemon.
//!
//! Boots the worker pool, the managed persistence sidecar and the venue
//! connectors, then runs until interrupted. Configuration comes from the
//! environment (FLOWTRACE_* variables, .env honoured).

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use flowtrace_backend::models::AppConfig;
use flowtrace_backend::orchestrator::IngestionOrchestrator;
use flowtrace_backend::pool::{PoolConfig, WorkerPool};
use flowtrace_backend::sidecar::{SidecarSupervisor, SupervisorConfig};
use flowtrace_backend::storage::FootprintFileStore;
use flowtrace_backend::venue::StaticSymbolRepository;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "flowtrace_backend=info,flowtrace=info".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env();
    info!(
        data_dir = %config.data_dir,
        workers = config.worker_count,
        socket = %config.sidecar_socket_path,
        "flowtrace starting"
    );

    let store = Arc::new(
        FootprintFileStore::new(&config.data_dir).with_metadata(config.write_metadata),
    );

    let pool_config = PoolConfig {
        worker_count: config.worker_count,
        socket_path: config.sidecar_socket_path.clone(),
        flush_interval: std::time::Duration::from_secs(config.flush_interval_secs),
        intervals: config.intervals.clone(),
        ..PoolConfig::default()
    };
    let pool = WorkerPool::new(pool_config, Arc::clone(&store));

    // The sidecar runs as a separate process owning the state database.
    let sidecar_bin = std::env::var("FLOWTRACE_SIDECAR_BIN")
        .unwrap_or_else(|_| "flowtrace-sidecar".to_string());
    let supervisor = SidecarSupervisor::new(SupervisorConfig::new(
        sidecar_bin,
        vec![
            "--socket".to_string(),
            config.sidecar_socket_path.clone(),
            "--db".to_string(),
            config.sidecar_db_path.clone(),
        ],
    ));

    // Active symbols come from the configuration repository; the static
    // implementation reads FLOWTRACE_SYMBOLS ("BINANCE:BTCUSDT:0.1,...").
    let repo = Arc::new(build_repository()?);

    let orchestrator = IngestionOrchestrator::new(
        config,
        repo,
        pool,
        Arc::clone(&store),
        Some(supervisor),
    );

    orchestrator
        .start_ingestion()
        .await
        .context("ingestion startup failed")?;
    info!(status = %orchestrator.get_status(), "ingestion up");

    tokio::signal::ctrl_c().await.ok();
    info!("interrupt received; shutting down");
    orchestrator.stop_ingestion().await;
    info!(store = %store.stats.summary(), "bye");
    Ok(())
}

fn build_repository() -> Result<StaticSymbolRepository> {
    let mut symbols = Vec::new();
    if let Ok(raw) = std::env::var("FLOWTRACE_SYMBOLS") {
        for spec in raw.split(',').filter(|s| !s.trim().is_empty()) {
            let parts: Vec<&str> = spec.trim().split(':').collect();
            if parts.len() != 3 {
                error!(spec, "ignoring malformed symbol spec (want VENUE:SYMBOL:TICK)");
                continue;
            }
            let venue = flowtrace_backend::models::Venue::from_str(parts[0])
                .with_context(|| format!("unknown venue in {spec}"))?;
            let tick: f64 = parts[2]
                .parse()
                .with_context(|| format!("bad tick value in {spec}"))?;
            symbols.push(flowtrace_backend::models::SymbolConfig::new(
                venue, parts[1], tick,
            ));
        }
    }
    Ok(StaticSymbolRepository::new(symbols))
}
