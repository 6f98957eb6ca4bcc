//! Worker callbacks: route a leased job's result into the integration
//! engine, then settle the job in the ledger.

use std::sync::Arc;

use errors::{NotebookError, Result, StorageError};
use nb_core::{
    Claim, Entry, EntryId, FailOutcome, Job, JobId, JobType, NotebookStore, ReclaimReport,
};
use serde_json::json;
use tracing::{instrument, warn};

use crate::integration::IntegrationEngine;
use crate::ledger::JobLedger;

pub struct Pipeline {
    store: Arc<dyn NotebookStore>,
    ledger: JobLedger,
    engine: IntegrationEngine,
}

impl Pipeline {
    pub fn new(store: Arc<dyn NotebookStore>, ledger: JobLedger, engine: IntegrationEngine) -> Self {
        Self {
            store,
            ledger,
            engine,
        }
    }

    pub fn ledger(&self) -> &JobLedger {
        &self.ledger
    }

    pub fn engine(&self) -> &IntegrationEngine {
        &self.engine
    }

    pub async fn load_entry(&self, entry_id: EntryId) -> Result<Entry> {
        self.store
            .get_entry(entry_id)
            .await?
            .ok_or_else(|| NotebookError::not_found("entry", entry_id))
    }

    /// The job, provided `worker_id` still holds its lease and it is of the
    /// expected type.
    async fn held_job(&self, job_id: JobId, worker_id: &str, expected: JobType) -> Result<Job> {
        let job = self
            .ledger
            .get(job_id)
            .await?
            .ok_or_else(|| NotebookError::not_found("job", job_id))?;
        if !job.is_held_by(worker_id) {
            return Err(StorageError::StaleClaim {
                job_id: job_id.to_string(),
                worker_id: worker_id.to_string(),
            }
            .into());
        }
        if job.job_type != expected {
            return Err(NotebookError::invalid(
                "job_type",
                format!("job {job_id} is {}, not {expected}", job.job_type),
            ));
        }
        Ok(job)
    }

    #[instrument(skip(self, claims), fields(claim_count = claims.len()))]
    pub async fn report_extraction(
        &self,
        job_id: JobId,
        worker_id: &str,
        claims: Vec<Claim>,
    ) -> Result<Entry> {
        let job = self
            .held_job(job_id, worker_id, JobType::ExtractClaims)
            .await?;
        let count = claims.len();
        let entry = self
            .engine
            .on_extraction_complete(job.entry_id, claims)
            .await?;
        self.ledger
            .complete(
                job_id,
                worker_id,
                json!({ "claims": count, "claims_status": entry.claims_status }),
            )
            .await?;
        Ok(entry)
    }

    #[instrument(skip(self, embedding), fields(dimensions = embedding.len()))]
    pub async fn report_embedding(
        &self,
        job_id: JobId,
        worker_id: &str,
        embedding: Vec<f32>,
    ) -> Result<Entry> {
        let job = self.held_job(job_id, worker_id, JobType::EmbedText).await?;
        let dimensions = embedding.len();
        let entry = self
            .engine
            .on_embedding_complete(job.entry_id, embedding)
            .await?;
        self.ledger
            .complete(job_id, worker_id, json!({ "dimensions": dimensions }))
            .await?;
        Ok(entry)
    }

    /// Runs a leased scoring job. Rescores scheduled by a cascade carry
    /// `cascade: false` and never schedule further rescores.
    #[instrument(skip(self))]
    pub async fn run_scoring(&self, job_id: JobId, worker_id: &str) -> Result<Entry> {
        let job = self
            .held_job(job_id, worker_id, JobType::ScoreIntegration)
            .await?;
        let cascade = job
            .payload
            .get("cascade")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);
        let outcome = self.engine.score(job.entry_id, cascade).await?;
        self.ledger
            .complete(
                job_id,
                worker_id,
                json!({
                    "integration_status": outcome.entry.integration_status,
                    "max_friction": outcome.entry.max_friction,
                    "changed": outcome.changed,
                }),
            )
            .await?;
        Ok(outcome.entry)
    }

    /// Records a failed attempt. The attempt that spends the last retry
    /// fails the entry's stage.
    #[instrument(skip(self))]
    pub async fn report_failure(
        &self,
        job_id: JobId,
        worker_id: &str,
        error: &str,
    ) -> Result<FailOutcome> {
        let outcome = self.ledger.fail(job_id, worker_id, error).await?;
        if let FailOutcome::Exhausted(job) = &outcome {
            self.engine.on_stage_failed(job).await?;
        }
        Ok(outcome)
    }

    pub async fn reclaim_expired(&self) -> Result<ReclaimReport> {
        let report = self.ledger.reclaim_expired().await?;
        for job in &report.exhausted {
            if let Err(e) = self.engine.on_stage_failed(job).await {
                warn!(job_id = %job.id, error = %e, "Failed to record exhausted job");
            }
        }
        Ok(report)
    }
}
