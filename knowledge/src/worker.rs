//! Polling worker.
//!
//! Leases jobs of its types, runs the external [`ContentProcessor`] for
//! extraction and embedding, and reports the outcome. Expired leases are
//! reclaimed between jobs on an interval. Cancelling a worker mid-job leaves
//! the job claimed until its lease runs out.

use std::sync::Arc;
use std::time::Duration;

use config::JobsConfig;
use errors::{NotebookError, Result, StorageError};
use nb_core::{ContentProcessor, FailOutcome, Job, JobId, JobType};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pipeline::Pipeline;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed(JobId),
    Retrying(JobId),
    Exhausted(JobId),
    /// The lease moved to another worker before the result was reported.
    LeaseLost(JobId),
}

pub struct Worker {
    id: String,
    job_types: Vec<JobType>,
    pipeline: Arc<Pipeline>,
    processor: Arc<dyn ContentProcessor>,
    poll_interval: Duration,
    reclaim_interval: Duration,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        pipeline: Arc<Pipeline>,
        processor: Arc<dyn ContentProcessor>,
        config: &JobsConfig,
    ) -> Self {
        Self {
            id: id.into(),
            job_types: JobType::ALL.to_vec(),
            pipeline,
            processor,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            reclaim_interval: Duration::from_secs(config.reclaim_interval_seconds.max(1)),
        }
    }

    pub fn with_job_types(mut self, job_types: &[JobType]) -> Self {
        self.job_types = job_types.to_vec();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Leases and processes at most one job.
    pub async fn run_once(&self) -> Result<Option<JobOutcome>> {
        let Some(job) = self
            .pipeline
            .ledger()
            .claim_next(&self.id, &self.job_types)
            .await?
        else {
            return Ok(None);
        };

        let result = match job.job_type {
            JobType::ExtractClaims => self.extract(&job).await,
            JobType::EmbedText => self.embed(&job).await,
            JobType::ScoreIntegration => self
                .pipeline
                .run_scoring(job.id, &self.id)
                .await
                .map(|_| ()),
        };

        match result {
            Ok(()) => Ok(Some(JobOutcome::Completed(job.id))),
            Err(NotebookError::Storage(StorageError::StaleClaim { .. })) => {
                warn!(job_id = %job.id, worker_id = %self.id, "Lease lost before reporting");
                Ok(Some(JobOutcome::LeaseLost(job.id)))
            }
            Err(e) => {
                let outcome = self
                    .pipeline
                    .report_failure(job.id, &self.id, &e.to_string())
                    .await?;
                Ok(Some(match outcome {
                    FailOutcome::Retrying(_) => JobOutcome::Retrying(job.id),
                    FailOutcome::Exhausted(_) => JobOutcome::Exhausted(job.id),
                }))
            }
        }
    }

    async fn extract(&self, job: &Job) -> Result<()> {
        let entry = self.pipeline.load_entry(job.entry_id).await?;
        let claims = self
            .processor
            .extract_claims(&entry.content, &entry.content_type)
            .await
            .map_err(|e| NotebookError::Transient {
                reason: e.to_string(),
            })?;
        self.pipeline
            .report_extraction(job.id, &self.id, claims)
            .await?;
        Ok(())
    }

    async fn embed(&self, job: &Job) -> Result<()> {
        let entry = self.pipeline.load_entry(job.entry_id).await?;
        let embedding =
            self.processor
                .embed(&entry.content)
                .await
                .map_err(|e| NotebookError::Transient {
                    reason: e.to_string(),
                })?;
        self.pipeline
            .report_embedding(job.id, &self.id, embedding)
            .await?;
        Ok(())
    }

    /// Polls until `cancel` fires. Only cancellation interrupts a job in
    /// flight; reclaim runs between jobs once its interval has elapsed.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(worker_id = %self.id, job_types = ?self.job_types, "Worker started");
        let mut last_reclaim: Option<Instant> = None;

        loop {
            if last_reclaim.is_none_or(|at| at.elapsed() >= self.reclaim_interval) {
                if let Err(e) = self.pipeline.reclaim_expired().await {
                    warn!(worker_id = %self.id, error = %e, "Reclaim failed");
                }
                last_reclaim = Some(Instant::now());
            }

            let idle = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                result = self.run_once() => match result {
                    Ok(Some(outcome)) => {
                        debug!(worker_id = %self.id, ?outcome, "Processed job");
                        false
                    }
                    Ok(None) => true,
                    Err(e) => {
                        warn!(worker_id = %self.id, error = %e, "Worker iteration failed");
                        true
                    }
                },
            };

            if idle {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }
        info!(worker_id = %self.id, "Worker stopped");
    }
}
