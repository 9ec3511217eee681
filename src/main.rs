//! netpulse - Network latency monitor
//!
//! Pings a set of hosts on a fixed interval, stores every result in SQLite
//! and serves the history over a JSON API.

mod config;
mod db;
mod probe;
mod scheduler;
mod status;
mod web;

use config::ServerConfig;
use db::Store;
use probe::Prober;
use scheduler::{Scheduler, SchedulerConfig};
use web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("netpulse=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting netpulse on {}:{}...", cfg.http_host, cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database; failure here is fatal
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    let added = store.bootstrap_hosts(&cfg.monitored_hosts)?;
    if added > 0 {
        tracing::info!("Registered {} configured hosts", added);
    }

    // Start scheduler
    let prober = Prober::new(cfg.ping_timeout_duration(), cfg.ping_retries);
    let scheduler = Arc::new(Scheduler::new(store.clone(), prober, SchedulerConfig::from(&cfg)));
    scheduler.start().await?;

    // Serve until Ctrl+C, then drain the scheduler
    let server = Server::new(cfg, store, scheduler.clone());
    let served = server.start(shutdown_signal()).await;

    scheduler.shutdown().await;
    tracing::info!("netpulse stopped");
    served
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
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
                tracing::error!("Failed to listen for SIGTERM: {}", e);
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
