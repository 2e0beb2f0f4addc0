//! netpoll - network device reachability poller
//!
//! Keeps a registry of network devices and periodically probes each one,
//! recording whether it is online or offline.

mod clock;
mod config;
mod db;
mod probe;
mod scheduler;
mod web;

use clock::SystemClock;
use config::ServerConfig;
use db::Store;
use probe::PingProber;
use scheduler::{Poller, RetentionManager, Scheduler};
use web::Server;

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("netpoll=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting netpoll on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    let poller = Poller::new(
        store.clone(),
        Arc::new(PingProber),
        Arc::new(SystemClock),
        cfg.probe_timeout,
        cfg.poll_concurrency,
    );

    let shutdown = CancellationToken::new();
    let retention = Arc::new(RetentionManager::new(store.clone(), cfg.history_retention));

    match cfg.poll_interval {
        Some(interval) => {
            let scheduler = Scheduler::new(poller.clone(), interval, retention);
            scheduler.start(shutdown.clone());
        }
        None => {
            tracing::info!("Scheduled polling disabled");
            retention.start(shutdown.clone());
        }
    }

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        tracing::info!("Shutdown requested");
        signal_token.cancel();
    });

    // Start web server
    let server = Server::new(cfg, store, poller, shutdown);
    server.start().await?;

    Ok(())
}
