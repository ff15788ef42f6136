//! Webhook retry worker.
//!
//! Connects to PostgreSQL, applies the webhook migrations and runs the
//! retry scheduler until SIGINT or SIGTERM.

mod config;
mod logging;

use std::sync::Arc;

use crm_webhooks::{HttpDeliveryExecutor, PgStore, RetryScheduler, EVENT_CATALOG_VERSION};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

use config::WorkerConfig;

#[tokio::main]
async fn main() {
    let config = match WorkerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("FATAL: Configuration error: {e}");
            std::process::exit(1);
        }
    };

    logging::init_logging(&config.log_filter);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        event_catalog_version = EVENT_CATALOG_VERSION,
        "Starting webhook worker"
    );

    if let Err(e) = run(config).await {
        error!(error = %e, "Webhook worker failed");
        std::process::exit(1);
    }
}

async fn run(config: WorkerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await?;
    info!(
        max_connections = config.max_connections,
        "Connected to database"
    );

    let store = Arc::new(PgStore::new(pool.clone()));
    store.migrate().await?;

    let executor = Arc::new(HttpDeliveryExecutor::new(
        config.webhooks.http_timeout,
        config.webhooks.target_policy,
    )?);

    let scheduler = Arc::new(RetryScheduler::from_config(
        store,
        executor,
        &config.webhooks,
    ));

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let worker = tokio::spawn(scheduler.run(cancel_rx));

    shutdown_signal().await;
    // The receiver is gone only if the loop already exited.
    let _ = cancel_tx.send(true);

    if let Err(e) = worker.await {
        error!(error = %e, "Retry loop terminated abnormally");
    }
    pool.close().await;
    info!("Webhook worker stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
