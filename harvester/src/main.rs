use anyhow::Context;
use serde::Deserialize;
use tracing::{error, info, warn};

use harvester::config::HarvesterConfig;
use harvester::crawler::{DataKind, TimeWindow};
use harvester::logging::init_logging;
use harvester::services::ServiceContainer;
use harvester::utils::http_client::install_rustls_provider;

const BATCH_ENV: &str = "HARVEST_BATCH";

/// Work description read from the `HARVEST_BATCH` file.
#[derive(Debug, Deserialize)]
struct Batch {
    keywords: Vec<String>,
    areas: Vec<String>,
    windows: Vec<TimeWindow>,
    #[serde(default = "default_kinds")]
    kinds: Vec<DataKind>,
}

fn default_kinds() -> Vec<DataKind> {
    vec![DataKind::Search]
}

fn read_batch() -> anyhow::Result<Batch> {
    let path = std::env::var(BATCH_ENV)
        .with_context(|| format!("{BATCH_ENV} must point to a batch file"))?;
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read batch file {path}"))?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid batch file {path}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    install_rustls_provider();

    let config = HarvesterConfig::from_env()?;
    let (logging, _guard) = init_logging(&config.log_dir)?;

    let batch = read_batch()?;
    info!(
        keywords = batch.keywords.len(),
        areas = batch.areas.len(),
        windows = batch.windows.len(),
        kinds = batch.kinds.len(),
        "Loaded batch"
    );

    let services = ServiceContainer::new(&config).await?;
    logging.start_retention_cleanup(services.cancellation_token());
    services.initialize();

    let orchestrator = services.orchestrator.clone();
    let queued = orchestrator.submit_tasks(&batch.keywords, &batch.areas, &batch.windows, &batch.kinds);
    if queued == 0 {
        info!("Nothing to do, every unit is already complete");
    } else {
        orchestrator.start()?;

        let stopper = orchestrator.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, stopping after in-flight requests");
                stopper.stop();
            }
        });
    }

    let summary = orchestrator.wait().await?;
    info!(
        total = summary.total,
        succeeded = summary.succeeded,
        failed = summary.failed,
        skipped = summary.skipped,
        unrecorded = summary.unrecorded,
        percent = summary.percent,
        "Run summary"
    );

    if let Err(e) = services.shutdown().await {
        error!(error = %e, "Shutdown did not complete cleanly");
    }
    Ok(())
}
