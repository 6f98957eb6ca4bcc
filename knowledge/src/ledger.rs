//! Job ledger: enqueue, lease, complete, fail and reclaim.
//!
//! All atomicity lives in the store. The ledger picks priorities and
//! timeouts from configuration and records metrics.

use std::sync::Arc;

use config::JobsConfig;
use errors::Result;
use nb_core::{
    Entry, EntryId, FailOutcome, Job, JobId, JobStatus, JobType, NewEntry, NewJob, NotebookId,
    NotebookStore, ReclaimReport,
};
use observability::metrics;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::retry::on_contention;

fn record_enqueued(job: &Job) {
    metrics::record_job_enqueued(job_type_label(job.job_type));
    debug!(job_id = %job.id, entry_id = %job.entry_id, job_type = %job.job_type, "Enqueued job");
}

#[derive(Clone)]
pub struct JobLedger {
    store: Arc<dyn NotebookStore>,
    config: JobsConfig,
}

impl JobLedger {
    pub fn new(store: Arc<dyn NotebookStore>, config: JobsConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &JobsConfig {
        &self.config
    }

    pub fn priority_for(&self, job_type: JobType) -> i32 {
        match job_type {
            JobType::ExtractClaims => self.config.extract_priority,
            JobType::EmbedText => self.config.embed_priority,
            JobType::ScoreIntegration => self.config.score_priority,
        }
    }

    fn new_job(
        &self,
        notebook_id: NotebookId,
        entry_id: EntryId,
        job_type: JobType,
        payload: serde_json::Value,
    ) -> NewJob {
        NewJob {
            notebook_id,
            entry_id,
            job_type,
            payload,
            priority: self.priority_for(job_type),
            timeout_seconds: self.config.default_timeout_seconds,
            max_retries: self.config.default_max_retries,
        }
    }

    pub async fn enqueue(
        &self,
        notebook_id: NotebookId,
        entry_id: EntryId,
        job_type: JobType,
        payload: serde_json::Value,
    ) -> Result<Job> {
        self.enqueue_job(self.new_job(notebook_id, entry_id, job_type, payload))
            .await
    }

    pub async fn enqueue_job(&self, job: NewJob) -> Result<Job> {
        let job = self.store.insert_job(job).await?;
        record_enqueued(&job);
        Ok(job)
    }

    /// Extraction and embedding jobs for a fresh entry.
    pub fn fan_out(&self, entry: &NewEntry) -> Vec<NewJob> {
        [JobType::ExtractClaims, JobType::EmbedText]
            .into_iter()
            .map(|job_type| {
                self.new_job(
                    entry.notebook_id,
                    entry.id,
                    job_type,
                    json!({ "content_type": entry.content_type }),
                )
            })
            .collect()
    }

    /// Appends `entries` with their fanned-out jobs in one atomic store
    /// call, retrying sequence collisions up to `retries` times. A failure
    /// leaves neither entries nor jobs behind.
    pub async fn append_with_jobs(
        &self,
        entries: &[NewEntry],
        retries: usize,
    ) -> Result<Vec<(Entry, Vec<Job>)>> {
        let batch: Vec<(NewEntry, Vec<NewJob>)> = entries
            .iter()
            .map(|entry| (entry.clone(), self.fan_out(entry)))
            .collect();
        let batch = &batch;
        let written = on_contention("append_entry", retries, || async move {
            self.store.append_entries_with_jobs(batch.clone()).await
        })
        .await?;
        for job in written.iter().flat_map(|(_, jobs)| jobs) {
            record_enqueued(job);
        }
        Ok(written)
    }

    /// Schedules a rescore unless one is already waiting or running.
    pub async fn enqueue_rescore(&self, entry: &Entry, cascade: bool) -> Result<Option<Job>> {
        let outstanding = self
            .store
            .jobs_for_entry(entry.id)
            .await?
            .into_iter()
            .any(|j| {
                j.job_type == JobType::ScoreIntegration
                    && matches!(j.status, JobStatus::Pending | JobStatus::Claimed)
            });
        if outstanding {
            debug!(entry_id = %entry.id, "Rescore already scheduled");
            return Ok(None);
        }
        let job = self
            .enqueue(
                entry.notebook_id,
                entry.id,
                JobType::ScoreIntegration,
                json!({ "cascade": cascade }),
            )
            .await?;
        Ok(Some(job))
    }

    pub async fn claim_next(&self, worker_id: &str, types: &[JobType]) -> Result<Option<Job>> {
        let job = self.store.claim_next(worker_id, types).await?;
        if let Some(job) = &job {
            metrics::record_job_claimed(job_type_label(job.job_type));
            debug!(job_id = %job.id, worker_id, retry_count = job.retry_count, "Claimed job");
        }
        Ok(job)
    }

    pub async fn complete(
        &self,
        job_id: JobId,
        worker_id: &str,
        result: serde_json::Value,
    ) -> Result<Job> {
        let job = self.store.complete_job(job_id, worker_id, result).await?;
        metrics::record_job_completed(job_type_label(job.job_type));
        debug!(%job_id, worker_id, "Completed job");
        Ok(job)
    }

    pub async fn fail(&self, job_id: JobId, worker_id: &str, error: &str) -> Result<FailOutcome> {
        let outcome = self.store.fail_job(job_id, worker_id, error).await?;
        let job = outcome.job();
        metrics::record_job_failed(job_type_label(job.job_type), outcome.is_exhausted());
        if outcome.is_exhausted() {
            warn!(%job_id, entry_id = %job.entry_id, job_type = %job.job_type, error, "Job exhausted its retries");
        } else {
            info!(%job_id, retry_count = job.retry_count, max_retries = job.max_retries, error, "Job failed, will retry");
        }
        Ok(outcome)
    }

    pub async fn reclaim_expired(&self) -> Result<ReclaimReport> {
        let report = self.store.reclaim_expired().await?;
        if report.count() > 0 {
            metrics::record_jobs_reclaimed(report.requeued.len(), report.exhausted.len());
            info!(
                requeued = report.requeued.len(),
                exhausted = report.exhausted.len(),
                "Reclaimed expired jobs"
            );
        }
        Ok(report)
    }

    pub async fn get(&self, job_id: JobId) -> Result<Option<Job>> {
        Ok(self.store.get_job(job_id).await?)
    }

    pub async fn jobs_for_entry(&self, entry_id: EntryId) -> Result<Vec<Job>> {
        Ok(self.store.jobs_for_entry(entry_id).await?)
    }

    pub async fn job_counts(&self) -> Result<Vec<(JobStatus, i64)>> {
        Ok(self.store.job_counts().await?)
    }
}

fn job_type_label(job_type: JobType) -> &'static str {
    match job_type {
        JobType::ExtractClaims => "extract_claims",
        JobType::EmbedText => "embed_text",
        JobType::ScoreIntegration => "score_integration",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use nb_core::{AuthorId, EntryStore, ManualClock, NewEntry, Notebook};
    use storage::InMemoryBackend;

    async fn ledger_with_entry() -> (JobLedger, Arc<ManualClock>, Entry) {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(InMemoryBackend::with_clock(clock.clone()));
        let author = AuthorId::new("alice").unwrap();
        let nb = store
            .create_notebook(Notebook::new("lab", author.clone(), Utc::now()))
            .await
            .unwrap();
        let entry = store
            .append_entry(NewEntry::new(nb.id, author, "the sky is blue"))
            .await
            .unwrap();
        let config = JobsConfig {
            default_timeout_seconds: 5,
            ..Default::default()
        };
        (JobLedger::new(store, config), clock, entry)
    }

    #[tokio::test]
    async fn test_entry_fans_out_into_two_jobs() {
        let store = Arc::new(InMemoryBackend::new());
        let author = AuthorId::new("alice").unwrap();
        let nb = store
            .create_notebook(Notebook::new("lab", author.clone(), Utc::now()))
            .await
            .unwrap();
        let config = JobsConfig {
            default_timeout_seconds: 5,
            ..Default::default()
        };
        let ledger = JobLedger::new(store, config);

        let written = ledger
            .append_with_jobs(&[NewEntry::new(nb.id, author, "the sky is blue")], 3)
            .await
            .unwrap();
        let (entry, jobs) = &written[0];

        let types: Vec<JobType> = jobs.iter().map(|j| j.job_type).collect();
        assert_eq!(types, vec![JobType::ExtractClaims, JobType::EmbedText]);
        assert!(jobs.iter().all(|j| j.status == JobStatus::Pending));
        assert!(jobs.iter().all(|j| j.timeout_seconds == 5));
        assert_eq!(ledger.jobs_for_entry(entry.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_rescore_is_not_duplicated() {
        let (ledger, _, entry) = ledger_with_entry().await;
        assert!(ledger.enqueue_rescore(&entry, false).await.unwrap().is_some());
        assert!(ledger.enqueue_rescore(&entry, false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_crashed_claimant_is_reclaimed_after_timeout() {
        let (ledger, clock, entry) = ledger_with_entry().await;
        ledger
            .enqueue(entry.notebook_id, entry.id, JobType::ExtractClaims, json!({}))
            .await
            .unwrap();
        let types = [JobType::ExtractClaims];

        let first = ledger.claim_next("crashed", &types).await.unwrap().unwrap();
        assert!(ledger.claim_next("other", &types).await.unwrap().is_none());

        clock.advance(Duration::seconds(5));
        let second = ledger.claim_next("other", &types).await.unwrap().unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(ledger.job_counts().await.unwrap(), vec![(JobStatus::Claimed, 1)]);
    }
}
