use anyhow::Context;

use tubewatch_infra::config::AppConfig;
use tubewatch_infra::runtime::Runtime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load().context("failed to load configuration")?;
    tubewatch_observability::init_with(&config.logging);

    let runtime = Runtime::start(&config).context("failed to start runtime")?;
    tracing::info!(
        workers = config.workers.count,
        queues = ?config.workers.queues,
        "tubewatch worker running; press ctrl-c to stop"
    );

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    tracing::info!("shutdown requested");

    match runtime.stats() {
        Ok(stats) => tracing::info!(stats = %serde_json::to_string(&stats)?, "final statistics"),
        Err(e) => tracing::warn!(error = %e, "statistics unavailable"),
    }

    // Joining worker threads blocks; keep it off the async executor.
    tokio::task::spawn_blocking(move || runtime.shutdown())
        .await
        .context("shutdown task failed")?;
    Ok(())
}
