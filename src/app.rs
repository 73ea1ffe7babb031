/// Application setup and initialization
///
/// Wires together database, flow registry, execution engine, scheduler and the
/// service facade, then runs the daemon until interrupted.

use crate::{
    config::Config,
    database::Database,
    flow::{FlowRegistry, FlowStorage},
    runtime::{Engine, Scheduler},
    service::FlowService,
};
use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Fully wired engine components
#[derive(Clone)]
pub struct App {
    pub database: Database,
    pub service: FlowService,
}

/// Build every component against the configured database
///
/// Loads stored flows and reconciles leftovers of a previous process before
/// returning, so the caller can accept work immediately.
pub async fn create_app(config: Config) -> Result<App> {
    tracing::info!("📁 Opening engine database in {}", config.database.data_dir);
    let database = Database::connect(&config.database.data_dir).await?;

    tracing::info!("📊 Initializing flow registry");
    let registry = Arc::new(FlowRegistry::new(FlowStorage::new(database.pool().clone())));

    tracing::info!("🚀 Initializing execution engine");
    let engine = Engine::new(&database, registry, config.engine.clone());

    tracing::info!("⏰ Initializing cron scheduler");
    let scheduler = Scheduler::new(&database, engine.clone(), config.scheduler.clone());

    let service = FlowService::new(engine, scheduler);
    let report = service
        .init()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to initialize engine state: {}", e))?;
    tracing::info!(
        orphaned = report.orphaned_checkpoints + report.orphaned_runs + report.corrupt_checkpoints,
        rearmed = report.rearmed,
        restored_slots = report.restored_slots,
        "✅ Engine state reconciled"
    );

    Ok(App { database, service })
}

/// Run the engine daemon until Ctrl-C
pub async fn start(config: Config) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting Mechaflow engine...");
    let app = create_app(config).await?;

    let scheduler = Arc::clone(app.service.scheduler());
    scheduler.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    scheduler.stop().await?;

    Ok(())
}
