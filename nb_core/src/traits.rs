//! Store and collaborator traits.
//!
//! Every backend implements the store traits against the same semantics; the
//! in-memory and Postgres backends in the `storage` crate are interchangeable.

use async_trait::async_trait;
use errors::StorageError;
use thiserror::Error;

use crate::types::{
    AccessGrant, AuditEvent, AuthorId, Claim, ClaimsStatus, Clearance, Entry, EntryId, FailOutcome,
    GroupId, GroupMembership, IntegrationUpdate, Job, JobId, JobStatus, JobType, MirroredClaim,
    NewEntry, NewJob, Notebook, NotebookId, ReclaimReport, Subscription, SubscriptionId,
};

pub type StorageResult<T> = Result<T, StorageError>;

#[async_trait]
pub trait EntryStore: Send + Sync {
    async fn create_notebook(&self, notebook: Notebook) -> StorageResult<Notebook>;

    async fn get_notebook(&self, id: NotebookId) -> StorageResult<Option<Notebook>>;

    /// Stamps the next per-notebook sequence number and persists the entry in
    /// one atomic step.
    async fn append_entry(&self, entry: NewEntry) -> StorageResult<Entry>;

    /// Appends entries in order, each with its jobs, as one atomic unit:
    /// either every entry and job is stored or none is.
    async fn append_entries_with_jobs(
        &self,
        batch: Vec<(NewEntry, Vec<NewJob>)>,
    ) -> StorageResult<Vec<(Entry, Vec<Job>)>>;

    async fn get_entry(&self, id: EntryId) -> StorageResult<Option<Entry>>;

    async fn get_entries(&self, ids: &[EntryId]) -> StorageResult<Vec<Entry>>;

    /// Entries with `sequence > after`, ascending, at most `limit`.
    async fn entries_after(
        &self,
        notebook_id: NotebookId,
        after: i64,
        limit: usize,
    ) -> StorageResult<Vec<Entry>>;

    async fn entries_by_topic(
        &self,
        notebook_id: NotebookId,
        topic: &str,
    ) -> StorageResult<Vec<Entry>>;

    /// Entries whose references or `revision_of` point at `target`.
    async fn entries_referencing(
        &self,
        notebook_id: NotebookId,
        target: EntryId,
    ) -> StorageResult<Vec<Entry>>;

    /// Distilled or verified entries that carry an embedding.
    async fn embedded_entries(&self, notebook_id: NotebookId) -> StorageResult<Vec<Entry>>;

    /// Writes claims and status if the entry is still at `expected_version`.
    async fn update_claims(
        &self,
        id: EntryId,
        claims: Vec<Claim>,
        status: ClaimsStatus,
        expected_version: i64,
    ) -> StorageResult<Entry>;

    async fn update_embedding(
        &self,
        id: EntryId,
        embedding: Vec<f32>,
        expected_version: i64,
    ) -> StorageResult<Entry>;

    async fn update_integration(
        &self,
        id: EntryId,
        update: IntegrationUpdate,
        expected_version: i64,
    ) -> StorageResult<Entry>;
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, job: NewJob) -> StorageResult<Job>;

    /// Atomically leases the best claimable job of the given types.
    async fn claim_next(&self, worker_id: &str, types: &[JobType]) -> StorageResult<Option<Job>>;

    /// Fails with `StaleClaim` unless `worker_id` still holds the lease.
    async fn complete_job(
        &self,
        id: JobId,
        worker_id: &str,
        result: serde_json::Value,
    ) -> StorageResult<Job>;

    async fn fail_job(&self, id: JobId, worker_id: &str, error: &str)
    -> StorageResult<FailOutcome>;

    async fn reclaim_expired(&self) -> StorageResult<ReclaimReport>;

    async fn get_job(&self, id: JobId) -> StorageResult<Option<Job>>;

    async fn jobs_for_entry(&self, entry_id: EntryId) -> StorageResult<Vec<Job>>;

    async fn job_counts(&self) -> StorageResult<Vec<(JobStatus, i64)>>;
}

#[async_trait]
pub trait MirrorStore: Send + Sync {
    async fn create_subscription(&self, subscription: Subscription)
    -> StorageResult<Subscription>;

    async fn get_subscription(&self, id: SubscriptionId) -> StorageResult<Option<Subscription>>;

    async fn list_subscriptions(&self) -> StorageResult<Vec<Subscription>>;

    /// Upserts `mirrors` and moves the watermark from `expected_watermark` to
    /// `new_watermark` in one step. Returns `false` when another pump already
    /// moved the watermark. Tombstoned mirrors are never overwritten, and
    /// mirrors of retracted entries are written tombstoned.
    async fn apply_mirrors(
        &self,
        subscription_id: SubscriptionId,
        mirrors: Vec<MirroredClaim>,
        expected_watermark: i64,
        new_watermark: i64,
    ) -> StorageResult<bool>;

    /// Tombstones every mirror of `entry_id` and records the retraction.
    /// Returns the number of mirrors newly tombstoned.
    async fn tombstone_source_entry(&self, entry_id: EntryId) -> StorageResult<u64>;

    async fn is_retracted(&self, entry_id: EntryId) -> StorageResult<bool>;

    /// Mirrors landing in `target`, ordered by subscription then source
    /// sequence.
    async fn list_mirrors(
        &self,
        target: NotebookId,
        include_tombstoned: bool,
    ) -> StorageResult<Vec<MirroredClaim>>;
}

#[async_trait]
pub trait AccessStore: Send + Sync {
    async fn get_grant(
        &self,
        notebook_id: NotebookId,
        author_id: &AuthorId,
    ) -> StorageResult<Option<AccessGrant>>;

    async fn put_grant(&self, grant: AccessGrant) -> StorageResult<()>;

    async fn delete_grant(&self, notebook_id: NotebookId, author_id: &AuthorId)
    -> StorageResult<bool>;

    async fn get_membership(
        &self,
        group_id: &GroupId,
        author_id: &AuthorId,
    ) -> StorageResult<Option<GroupMembership>>;

    async fn put_membership(&self, membership: GroupMembership) -> StorageResult<()>;

    /// Members of `group_id`, ordered by author.
    async fn list_members(&self, group_id: &GroupId) -> StorageResult<Vec<GroupMembership>>;

    async fn get_clearance(&self, author_id: &AuthorId) -> StorageResult<Option<Clearance>>;

    async fn put_clearance(&self, clearance: Clearance) -> StorageResult<()>;
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append_audit(&self, events: &[AuditEvent]) -> StorageResult<()>;

    /// Most recent first.
    async fn list_audit(
        &self,
        notebook_id: Option<NotebookId>,
        limit: usize,
    ) -> StorageResult<Vec<AuditEvent>>;
}

/// A backend that serves every store.
pub trait NotebookStore: EntryStore + JobStore + MirrorStore + AccessStore + AuditStore {}

impl<T> NotebookStore for T where T: EntryStore + JobStore + MirrorStore + AccessStore + AuditStore {}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProcessorError {
    #[error("Processor unavailable: {0}")]
    Unavailable(String),

    #[error("Processor rejected input: {0}")]
    Rejected(String),
}

/// External extraction and embedding collaborator invoked by workers.
#[async_trait]
pub trait ContentProcessor: Send + Sync {
    async fn extract_claims(
        &self,
        content: &str,
        content_type: &str,
    ) -> Result<Vec<Claim>, ProcessorError>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProcessorError>;
}
