//! Persistence sidecar process: owns the state database and serves the
//! socket protocol. Spawned and supervised by the ingestion daemon, but can
//! run standalone.
//!
//! Usage:
//!   cargo run --bin flowtrace-sidecar -- --socket ./flowtrace-sidecar.sock --db ./flowtrace-state.db

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use flowtrace_backend::sidecar::SidecarServer;

#[derive(Parser, Debug)]
#[command(name = "flowtrace-sidecar")]
#[command(about = "Persistence sidecar owning the canonical ingestion state database")]
struct Args {
    /// Unix-domain socket to listen on
    #[arg(long, env = "FLOWTRACE_SOCKET_PATH", default_value = "./flowtrace-sidecar.sock")]
    socket: String,

    /// Path to the SQLite state database
    #[arg(long, env = "FLOWTRACE_STATE_DB", default_value = "./flowtrace-state.db")]
    db: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "flowtrace_backend=info,flowtrace_sidecar=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    info!(socket = %args.socket, db = %args.db, "sidecar starting");
    let server = Arc::new(SidecarServer::open(&args.db)?);
    server.serve(&args.socket).await
}
