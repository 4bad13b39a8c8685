//! # FPL Refresh Service
//!
//! Continuous service that mirrors the FPL API into Postgres and keeps the
//! derived per-manager and per-league aggregates current.
//!
//! ## Usage
//!
//! ```bash
//! DATABASE_URL=postgres://... cargo run --bin refresh_service
//! ```
//!
//! Press Ctrl+C to stop gracefully: in-flight manager refreshes finish, no
//! new batches start.

use anyhow::Result;
use fpl_refresh::fpl_client::FplClient;
use fpl_refresh::orchestrator::Orchestrator;
use fpl_refresh::settings::Settings;
use fpl_refresh::store::postgres::{self, PgStore};
use fpl_refresh::store::SharedStore;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json_logs = std::env::var("LOG_FORMAT")
        .map(|f| f.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting FPL refresh service");

    let settings = Arc::new(Settings::new()?);
    let client = Arc::new(FplClient::new(&settings)?);

    let pool = postgres::connect().await?;
    let store: SharedStore = Arc::new(PgStore::new(pool));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
    });

    let orchestrator = Orchestrator::new(settings, client, store, shutdown_rx);
    orchestrator.run().await?;

    info!("FPL refresh service stopped");
    Ok(())
}
