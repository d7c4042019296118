// crates/supervisor/src/main.rs
//! Supervisor binary: keeps exactly one worker process alive.
//!
//! The worker command comes from `GENEDETECT_WORKER_CMD` (defaults to
//! `genedetect-worker` on PATH); everything else from `GENEDETECT_*`
//! configuration variables.

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use genedetect_core::OrchestratorConfig;
use genedetect_supervisor::{FileHeartbeatSource, Supervisor, WorkerProcess};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,genedetect_supervisor=info".into()),
        )
        .init();

    let config = OrchestratorConfig::from_env();
    info!(
        data_root = %config.data_root.display(),
        "genedetect supervisor v{}",
        env!("CARGO_PKG_VERSION")
    );

    let heartbeats = FileHeartbeatSource::new(&config.data_root);
    let process = WorkerProcess::from_env();
    let mut supervisor = Supervisor::new(config, process, heartbeats);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping supervisor and worker");
            let _ = shutdown_tx.send(true);
        }
    });

    supervisor
        .run(shutdown_rx)
        .await
        .context("worker restarts exhausted")?;
    Ok(())
}
