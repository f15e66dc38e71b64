use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::Instrument;

use super::{JobQueue, JobRecord, JobRegistry, JobState};
use crate::errors::{CapstoneError, QueueError};
use crate::logging;

/// Counts from one pass over the pending jobs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub done: usize,
    pub failed: usize,
}

/// Runs queued jobs one at a time, each to completion.
pub struct Worker<C> {
    ctx: Arc<C>,
    queue: Arc<dyn JobQueue>,
    jobs: Arc<JobRegistry<C>>,
    poll_interval: Duration,
}

impl<C: Send + Sync + 'static> Worker<C> {
    pub fn new(
        ctx: Arc<C>,
        queue: Arc<dyn JobQueue>,
        jobs: Arc<JobRegistry<C>>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            ctx,
            queue,
            jobs,
            poll_interval,
        }
    }

    /// Run every job currently pending, oldest first.
    pub async fn run_pending(&self) -> Result<RunSummary, QueueError> {
        let mut summary = RunSummary::default();
        for job in self.queue.pending()? {
            let span = logging::job_span(&job.name, &job.key);
            let state = self.run_job(&job).instrument(span).await;
            self.queue.finish(&job, state)?;
            match state {
                JobState::Failed => summary.failed += 1,
                _ => summary.done += 1,
            }
        }
        Ok(summary)
    }

    async fn run_job(&self, job: &JobRecord) -> JobState {
        let Some(handler) = self.jobs.get(&job.name) else {
            let err = CapstoneError::UnknownJob {
                name: job.name.clone(),
            };
            tracing::error!(error = %err, "Job failed");
            return JobState::Failed;
        };
        tracing::info!("Running job");
        match handler.run(&*self.ctx, &job.kwargs).await {
            Ok(()) => {
                tracing::info!("Job done");
                JobState::Done
            }
            Err(e) => {
                tracing::error!(error = %format!("{:#}", e), "Job failed");
                JobState::Failed
            }
        }
    }

    /// Poll until `shutdown` resolves. Shutdown is only observed between
    /// passes, so a running job always finishes.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            match self.run_pending().await {
                Ok(summary) if summary != RunSummary::default() => {
                    tracing::info!(done = summary.done, failed = summary.failed, "Processed jobs");
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Failed to process queue"),
            }
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Worker shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}
