use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use stagehand_core::config::{AppConfig, LoadOptions};
use stagehand_core::hierarchy::InMemoryHierarchyDirectory;
use stagehand_server::{bootstrap, health, runtime, telemetry};

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    let config = AppConfig::load(LoadOptions::default())?;
    telemetry::init_logging(&config.logging);

    tracing::warn!(
        event_name = "system.hierarchy.unconfigured",
        correlation_id = "bootstrap",
        "no organisation directory configured; hierarchy rules resolve to nobody and nothing escalates"
    );
    let resolver = Arc::new(InMemoryHierarchyDirectory::default());

    let app = bootstrap::bootstrap_with_config(config, resolver).await?;

    health::spawn(
        &app.config.server.bind_address,
        app.config.server.health_check_port,
        app.db_pool.clone(),
    )
    .await?;

    let background = runtime::spawn_sweeps(
        Arc::clone(&app.scheduler),
        Arc::clone(&app.watchdog),
        runtime::SweepSchedule::from_config(&app.config.workflow),
    );

    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        breach_threshold_hours = app.config.workflow.breach_threshold_hours,
        approval_sla_hours = app.config.workflow.approval_sla_hours,
        "stagehand-server started"
    );
    wait_for_shutdown().await?;
    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        "stagehand-server stopping"
    );

    background.shutdown(Duration::from_secs(app.config.server.graceful_shutdown_secs)).await;
    app.db_pool.close().await;

    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
