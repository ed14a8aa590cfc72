//! bourse daemon - ledger bootstrap plus the sweep scheduler
//!
//! Order placement and reads are library calls made by the surrounding
//! services; the daemon's job is to keep the periodic matching sweep
//! running until shutdown.

use anyhow::Result;
use bourse::config::AppConfig;
use bourse::db::Database;
use bourse::sweep::SweepScheduler;
use bourse::{logging, schema};

#[tokio::main]
async fn main() -> Result<()> {
    let env = std::env::args().nth(1).unwrap_or_else(|| "dev".to_string());
    let config = AppConfig::load(&env);
    let _guard = logging::init_logging(&config);

    tracing::info!(
        env = %env,
        git = env!("GIT_HASH"),
        "bourse starting"
    );

    let db = Database::connect(&config.database_url).await?;
    schema::init_schema(db.pool()).await?;

    let scheduler = SweepScheduler::start(db.pool().clone(), config.matching.clone());

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");

    scheduler.shutdown().await;
    tracing::info!("bourse stopped");
    Ok(())
}
