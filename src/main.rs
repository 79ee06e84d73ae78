//! hookrelay webhook message broker.
//!
//! Main entry point for the broker process. Initializes storage and the
//! delivery engine and coordinates graceful startup and shutdown.

mod config;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use hookrelay_core::{storage::Storage, RealClock};
use hookrelay_delivery::{
    storage::{memory::InMemoryStorage, DeliveryStorage},
    DeliveryEngine, PostgresDeliveryStorage,
};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info, warn};

use crate::config::{Config, LogFormat, StorageBackend};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(config.log_format)?;

    info!("Starting hookrelay broker");
    info!(
        storage = ?config.storage,
        database_url = %config.database_url_masked(),
        workers = config.worker_pool_size,
        max_attempts = config.max_attempts,
        "Configuration loaded"
    );

    let mut db_pool = None;
    let storage: Arc<dyn DeliveryStorage> = match config.storage {
        StorageBackend::Postgres => {
            let pool = create_database_pool(&config).await?;
            info!("Database connection pool established");

            let storage = Storage::new(pool.clone());
            storage.ensure_schema().await.context("Failed to create broker schema")?;
            info!("Database schema ready");

            db_pool = Some(pool);
            Arc::new(PostgresDeliveryStorage::new(Arc::new(storage)))
        },
        StorageBackend::Memory => {
            warn!("Using in-memory storage, jobs will not survive a restart");
            Arc::new(InMemoryStorage::new())
        },
    };

    let mut engine =
        DeliveryEngine::new(storage, config.to_delivery_config(), Arc::new(RealClock::new()))
            .context("Failed to build delivery engine")?;

    engine.start().await.context("Failed to start delivery workers")?;
    let recovered = engine.recover().await.context("Failed to recover pending jobs")?;
    info!(
        recovered,
        instance_id = %engine.config().instance_id,
        "hookrelay is dispatching deliveries"
    );

    shutdown_signal().await;
    info!("Shutdown signal received, starting graceful shutdown");

    let stats = engine.stats().await;
    info!(
        processed = stats.jobs_processed,
        delivered = stats.successful_deliveries,
        dead_lettered = stats.dead_lettered,
        in_flight = stats.in_flight_deliveries,
        "Draining delivery workers"
    );
    match engine.shutdown().await {
        Ok(()) => info!("Delivery engine stopped"),
        Err(e) => error!(error = %e, "Delivery engine did not stop cleanly"),
    }

    if let Some(pool) = db_pool {
        pool.close().await;
        info!("Database connections closed");
    }

    info!("hookrelay shutdown complete");
    Ok(())
}

/// Initializes tracing with environment-based filtering.
fn init_tracing(format: LogFormat) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,hookrelay=debug"))
        .context("Invalid RUST_LOG environment variable")?;

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true).with_span_list(false))
            .try_init(),
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_thread_names(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init(),
    }
    .context("Failed to install tracing subscriber")
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    let mut retries = 0;
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("Failed to verify database connection")?;

                return Ok(pool);
            },
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "Database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for CTRL+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            },
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received CTRL+C signal");
        },
        () = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
