use std::sync::Arc;

use loyalty::{Engine, accrual::AccrualClient, config::Config};
use ledger::adapters::{PostgresAdapter, postgres::PostgresSchemaLedgerAdapter};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    info!(
        accrual = %config.accrual_address,
        poll_interval_ms = config.poll_interval.as_millis() as u64,
        "starting loyalty reconciler"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_uri)
        .await?;
    let adapter = PostgresAdapter::from_pool(pool);
    adapter.init_ledger_schema().await?;

    let engine = Engine::new(Arc::new(adapter));
    let accrual = AccrualClient::new(&config.accrual_address, config.accrual_timeout)?;

    let shutdown = CancellationToken::new();
    let handle = engine
        .reconciler(Arc::new(accrual), config.poll_interval)
        .spawn(shutdown.clone());

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    shutdown.cancel();

    if let Err(e) = handle.await {
        error!(error = %e, "reconciler task failed");
    }
    Ok(())
}
