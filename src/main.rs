//! Portwatch - headless port blocking monitor.

use portwatch::config::AppConfig;
use portwatch::db::Store;
use portwatch::scanner::ScanOrchestrator;
use portwatch::scheduler::{RetentionManager, Scheduler};

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("portwatch=info".parse()?))
        .init();

    let cfg = AppConfig::load();
    tracing::info!("Using database at {}", cfg.db_path);

    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    let orchestrator = ScanOrchestrator::new(cfg.max_workers, cfg.probe_timeout);
    let scheduler = Scheduler::new(store.clone(), orchestrator)?;

    scheduler.on_result(|batch| {
        for result in batch {
            tracing::info!(
                "{}:{} {} ({} ms)",
                result.host,
                result.port,
                result.status,
                result.response_time_ms.map_or_else(|| "-".to_string(), |ms| ms.to_string())
            );
        }
    });
    scheduler.on_status(|message| tracing::info!("{}", message));

    let retention = RetentionManager::new(store.clone(), cfg.retention_days);
    retention.start();

    scheduler.start().await;
    let status = scheduler.get_monitoring_status()?;
    tracing::info!(
        "Monitoring {} on {} ports, next scan at {}",
        status.target_host,
        status.ports_count,
        status
            .next_scan
            .map_or_else(|| "-".to_string(), |t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    scheduler.stop().await;
    retention.stop();

    Ok(())
}
