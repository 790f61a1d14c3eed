use anyhow::{Context, Result, bail};
use consume_core::config::load_config;
use consume_core::ingestor::Ingestor;
use consume_core::telemetry::init_tracing;
use tracing::{error, info, warn};

/// Entry point for running long-lived consumption sessions on container
/// hosting services like AWS EKS, ECS, etc.
///
/// Loads the config from the path given as first argument, or from the
/// `INGEST_CONFIG` environment variable, then consumes every configured
/// partition group until each session ends or a shutdown signal arrives.
#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = load_config(config_path.as_deref())?;
    let ingestor = Ingestor::new(config)
        .await
        .context("Failed to set up consumption sessions")?;

    let shutdown = ingestor.shutdown_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown signal received, stopping sessions");
                shutdown.shutdown();
            }
            Err(e) => warn!("Failed to listen for shutdown signal: {}", e),
        }
    });

    let reports = ingestor.run().await;
    let mut failed = 0;
    for report in &reports {
        match &report.error {
            Some(e) => {
                failed += 1;
                error!(
                    partition_group = %report.partition_group,
                    kind = ?e.kind(),
                    offset = %report.current_offset,
                    "Session failed: {}",
                    e
                );
            }
            None => info!(
                partition_group = %report.partition_group,
                state = %report.state,
                offset = %report.current_offset,
                checkpointed = ?report.last_checkpointed_offset,
                metrics = ?report.metrics,
                "Session finished"
            ),
        }
    }

    if failed > 0 {
        bail!("{} of {} sessions failed", failed, reports.len());
    }
    Ok(())
}
