use std::sync::Arc;

use tracing::info;

use kitroom::clock::SystemClock;
use kitroom::config::Config;
use kitroom::fields::FieldRegistry;
use kitroom::hours::WeeklySchedule;
use kitroom::services::Services;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    kitroom::observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let hours = match &config.hours_file {
        Some(path) => WeeklySchedule::load(path)?,
        None => {
            tracing::warn!("no KITROOM_HOURS_FILE set, every location is closed");
            WeeklySchedule::new()
        }
    };

    let services = Services::start(
        &config.wal_path(),
        config.conflict_granularity,
        Arc::new(hours),
        Arc::new(FieldRegistry::new()),
        Arc::new(SystemClock),
    )?;
    services.spawn_jobs(config.overdue_sweep, config.compact_threshold);

    info!("kitroom started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  conflict granularity: {:?}", config.conflict_granularity);
    info!("  overdue sweep: every {}s", config.overdue_sweep.as_secs());
    info!("  metrics: {}", config.metrics_port.map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics")));

    // Run until SIGTERM/ctrl-c
    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }

    // Let in-flight commits reach the WAL before exiting (up to 10s).
    info!("shutdown signal received, flushing WAL...");
    let flushed = tokio::time::timeout(std::time::Duration::from_secs(10), services.store.wal_appends_since_compact()).await;
    if flushed.is_err() {
        tracing::warn!("WAL writer did not answer within 10s");
    }

    info!("kitroom stopped");
    Ok(())
}
