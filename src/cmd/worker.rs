//! `capstone worker`: runs queued pipeline jobs.

use std::sync::Arc;

use anyhow::Result;
use capstone::config::CapstoneConfig;
use capstone::lifecycle::Orchestrator;

pub async fn cmd_worker(config: CapstoneConfig, once: bool) -> Result<()> {
    let orchestrator = Arc::new(Orchestrator::from_config(config)?);
    let worker = orchestrator.worker();

    if once {
        let summary = worker.run_pending().await?;
        println!("{} done, {} failed", summary.done, summary.failed);
        return Ok(());
    }

    // Register the handler up front so a Ctrl+C during a job is not lost.
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                let _ = tx.send(());
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        }
    });

    tracing::info!(
        dir = %orchestrator.config.queue.dir.display(),
        "Worker started"
    );
    worker
        .run_until(async {
            let _ = rx.await;
        })
        .await;
    Ok(())
}
