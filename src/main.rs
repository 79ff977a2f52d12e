// Runs one launch-triggered sync cycle against the local database and prints
// the cycle report as JSON.

use harvest_sync::db;
use harvest_sync::{EngineConfig, Result, SyncEngine, Trigger};

#[tokio::main]
async fn main() {
    // Initialize logging - default to info level for our crate
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("harvest_sync=info"),
    )
    .init();

    if let Err(e) = run().await {
        log::error!("Sync failed: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let data_dir = std::env::current_dir().map_err(sqlx::Error::Io)?;
    let pool = db::init_db(&db::get_db_path(&data_dir)).await?;

    match db::get_db_stats(&pool).await {
        Ok(stats) => log::info!(
            "Database stats: {} reports, {} unconfirmed, {} drawing entries",
            stats.report_count,
            stats.unconfirmed_count,
            stats.drawing_entry_count
        ),
        Err(e) => log::warn!("Failed to read database stats: {}", e),
    }

    let config = EngineConfig::load(&pool).await?;
    let engine = SyncEngine::open(config, pool)?;

    let report = engine.run_cycle(Trigger::Launch).await;
    let status = engine.status().await;
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "cycle": report,
            "status": status,
        }))?
    );
    Ok(())
}
