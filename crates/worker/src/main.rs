// crates/worker/src/main.rs
//! Worker binary: claims and executes detection jobs until interrupted.
//!
//! Configuration comes from `GENEDETECT_*` environment variables; the
//! external detection tool is named by `GENEDETECT_PIPELINE_CMD`.

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use genedetect_core::OrchestratorConfig;
use genedetect_worker::{CommandPipeline, Worker};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,genedetect_worker=info,genedetect_store=info".into()),
        )
        .init();

    let config = OrchestratorConfig::from_env();
    let pipeline = CommandPipeline::from_env()
        .context("GENEDETECT_PIPELINE_CMD must name the detection tool")?;

    let worker = Worker::new(config, pipeline).context("open job store")?;
    info!(
        worker_id = %worker.worker_id(),
        data_root = %worker.store().root().display(),
        "genedetect worker v{}",
        env!("CARGO_PKG_VERSION")
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, finishing current job then stopping");
            let _ = shutdown_tx.send(true);
        }
    });

    worker.run(shutdown_rx).await.context("worker loop")?;
    Ok(())
}
