//! PostgreSQL backend implementing every store trait.
//!
//! Contended operations are single conditional statements or short
//! transactions:
//! - sequence allocation increments `notebooks.current_sequence` inside the
//!   insert transaction, so the notebook row lock orders concurrent writers;
//! - job claims select with `FOR UPDATE SKIP LOCKED` and update in the same
//!   statement;
//! - derived entry columns are written with a `version` guard;
//! - mirror batches move the subscription watermark with a compare-and-set.
//!
//! Timestamps come from the injected [`Clock`] rather than `NOW()` so lease
//! arithmetic agrees with the in-memory backend.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use errors::StorageError;
use nb_core::{
    AccessGrant, AccessStore, AuditEvent, AuditStore, AuthorId, Claim, ClaimsStatus, Clearance,
    Clock, Entry, EntryId, EntryStore, FailOutcome, GroupId, GroupMembership, IntegrationCost,
    IntegrationUpdate, Job, JobId, JobStatus, JobStore, JobType, MirrorStore, MirroredClaim,
    NewEntry, NewJob, Notebook, NotebookId, ReclaimReport, StorageResult, Subscription,
    SubscriptionFilter, SubscriptionId, SystemClock,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, PgPool};
use tracing::instrument;
use uuid::Uuid;

use crate::migrations;

const BACKEND: &str = "postgres";

fn db_err(e: sqlx::Error) -> StorageError {
    match &e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StorageError::ConnectionError {
                backend: BACKEND.to_string(),
                reason: e.to_string(),
            }
        }
        sqlx::Error::Database(db) if db.is_unique_violation() => StorageError::Duplicate {
            entity: db.table().unwrap_or("row").to_string(),
            id: db.constraint().unwrap_or_default().to_string(),
        },
        _ => StorageError::query(BACKEND, e),
    }
}

fn parse<T>(field: &str, value: &str) -> StorageResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| StorageError::serialization(field, format!("{value:?}: {e}")))
}

fn author(value: String) -> StorageResult<AuthorId> {
    AuthorId::new(value.clone())
        .ok_or_else(|| StorageError::serialization("author_id", format!("{value:?}")))
}

fn group(value: String) -> StorageResult<GroupId> {
    GroupId::new(value.clone())
        .ok_or_else(|| StorageError::serialization("group_id", format!("{value:?}")))
}

pub struct PostgresBackend {
    pool: PgPool,
    clock: Arc<dyn Clock>,
}

impl PostgresBackend {
    pub async fn connect(connection_url: &str, max_connections: u32) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(connection_url)
            .await
            .map_err(|e| StorageError::ConnectionError {
                backend: BACKEND.to_string(),
                reason: e.to_string(),
            })?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Applies pending forward-only migrations.
    pub async fn migrate(&self) -> StorageResult<Vec<i32>> {
        migrations::run_migrations(&self.pool).await.map_err(db_err)
    }

    async fn entry_exists(&self, id: EntryId) -> StorageResult<bool> {
        let row: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM entries WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.is_some())
    }

    /// Explains why a guarded entry update matched no row.
    async fn version_miss(&self, id: EntryId, expected_version: i64) -> StorageError {
        match self.entry_exists(id).await {
            Ok(true) => StorageError::VersionConflict {
                entity: "entry".to_string(),
                id: id.to_string(),
                expected: expected_version,
            },
            Ok(false) => StorageError::not_found(BACKEND, id),
            Err(e) => e,
        }
    }

    async fn claim_miss(&self, id: JobId, worker_id: &str) -> StorageError {
        match self.get_job(id).await {
            Ok(Some(_)) => StorageError::StaleClaim {
                job_id: id.to_string(),
                worker_id: worker_id.to_string(),
            },
            Ok(None) => StorageError::not_found(BACKEND, id),
            Err(e) => e,
        }
    }
}

impl std::fmt::Debug for PostgresBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresBackend").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

#[derive(Debug, FromRow)]
struct NotebookRow {
    id: Uuid,
    name: String,
    owner_id: String,
    group_id: Option<String>,
    classification: Option<String>,
    compartments: Vec<String>,
    current_sequence: i64,
    created_at: DateTime<Utc>,
}

impl TryFrom<NotebookRow> for Notebook {
    type Error = StorageError;

    fn try_from(row: NotebookRow) -> StorageResult<Self> {
        Ok(Notebook {
            id: NotebookId::from_uuid(row.id),
            name: row.name,
            owner_id: author(row.owner_id)?,
            group_id: row.group_id.map(group).transpose()?,
            classification: row
                .classification
                .as_deref()
                .map(|c| parse("classification", c))
                .transpose()?,
            compartments: row.compartments.into_iter().collect(),
            current_sequence: row.current_sequence,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct EntryRow {
    id: Uuid,
    notebook_id: Uuid,
    content: String,
    content_type: String,
    content_hash: String,
    author_id: String,
    signature: String,
    sequence: i64,
    created_at: DateTime<Utc>,
    topic: Option<String>,
    revision_of: Option<Uuid>,
    fragment_of: Option<Uuid>,
    fragment_index: Option<i32>,
    refs: Vec<Uuid>,
    claims: Json<Vec<Claim>>,
    claims_status: String,
    embedding: Option<Vec<f32>>,
    max_friction: Option<f64>,
    integration_cost: Option<Json<IntegrationCost>>,
    integration_status: String,
    needs_review: bool,
    metric_version: Option<String>,
    version: i64,
}

impl TryFrom<EntryRow> for Entry {
    type Error = StorageError;

    fn try_from(row: EntryRow) -> StorageResult<Self> {
        Ok(Entry {
            id: EntryId::from_uuid(row.id),
            notebook_id: NotebookId::from_uuid(row.notebook_id),
            content: row.content,
            content_type: row.content_type,
            content_hash: row.content_hash,
            author_id: author(row.author_id)?,
            signature: row.signature,
            sequence: row.sequence,
            created_at: row.created_at,
            topic: row.topic,
            revision_of: row.revision_of.map(EntryId::from_uuid),
            fragment_of: row.fragment_of.map(EntryId::from_uuid),
            fragment_index: row.fragment_index,
            references: row.refs.into_iter().map(EntryId::from_uuid).collect(),
            claims: row.claims.0,
            claims_status: parse("claims_status", &row.claims_status)?,
            embedding: row.embedding,
            max_friction: row.max_friction,
            integration_cost: row.integration_cost.map(|c| c.0),
            integration_status: parse("integration_status", &row.integration_status)?,
            needs_review: row.needs_review,
            metric_version: row.metric_version,
            version: row.version,
        })
    }
}

fn entries(rows: Vec<EntryRow>) -> StorageResult<Vec<Entry>> {
    rows.into_iter().map(Entry::try_from).collect()
}

#[derive(Debug, FromRow)]
struct JobRow {
    id: Uuid,
    notebook_id: Uuid,
    entry_id: Uuid,
    job_type: String,
    status: String,
    payload: serde_json::Value,
    result: Option<serde_json::Value>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    claimed_at: Option<DateTime<Utc>>,
    claimed_by: Option<String>,
    completed_at: Option<DateTime<Utc>>,
    timeout_seconds: i32,
    retry_count: i32,
    max_retries: i32,
    priority: i32,
}

impl TryFrom<JobRow> for Job {
    type Error = StorageError;

    fn try_from(row: JobRow) -> StorageResult<Self> {
        Ok(Job {
            id: JobId::from_uuid(row.id),
            notebook_id: NotebookId::from_uuid(row.notebook_id),
            entry_id: EntryId::from_uuid(row.entry_id),
            job_type: parse("job_type", &row.job_type)?,
            status: parse("status", &row.status)?,
            payload: row.payload,
            result: row.result,
            error: row.error,
            created_at: row.created_at,
            claimed_at: row.claimed_at,
            claimed_by: row.claimed_by,
            completed_at: row.completed_at,
            timeout_seconds: row.timeout_seconds,
            retry_count: row.retry_count,
            max_retries: row.max_retries,
            priority: row.priority,
        })
    }
}

#[derive(Debug, FromRow)]
struct SubscriptionRow {
    id: Uuid,
    source_notebook_id: Uuid,
    target_notebook_id: Uuid,
    filter: Json<SubscriptionFilter>,
    watermark: i64,
    created_by: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = StorageError;

    fn try_from(row: SubscriptionRow) -> StorageResult<Self> {
        Ok(Subscription {
            id: SubscriptionId::from_uuid(row.id),
            source_notebook_id: NotebookId::from_uuid(row.source_notebook_id),
            target_notebook_id: NotebookId::from_uuid(row.target_notebook_id),
            filter: row.filter.0,
            watermark: row.watermark,
            created_by: author(row.created_by)?,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct MirrorRow {
    subscription_id: Uuid,
    source_entry_id: Uuid,
    source_notebook_id: Uuid,
    claims: Json<Vec<Claim>>,
    topic: Option<String>,
    embedding: Option<Vec<f32>>,
    source_sequence: i64,
    tombstoned: bool,
    mirrored_at: DateTime<Utc>,
}

impl From<MirrorRow> for MirroredClaim {
    fn from(row: MirrorRow) -> Self {
        MirroredClaim {
            subscription_id: SubscriptionId::from_uuid(row.subscription_id),
            source_entry_id: EntryId::from_uuid(row.source_entry_id),
            source_notebook_id: NotebookId::from_uuid(row.source_notebook_id),
            claims: row.claims.0,
            topic: row.topic,
            embedding: row.embedding,
            source_sequence: row.source_sequence,
            tombstoned: row.tombstoned,
            mirrored_at: row.mirrored_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct GrantRow {
    notebook_id: Uuid,
    author_id: String,
    can_read: bool,
    can_write: bool,
    can_admin: bool,
    granted_by: String,
    granted_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct AuditRow {
    id: Uuid,
    notebook_id: Option<Uuid>,
    actor: String,
    action: String,
    outcome: String,
    target: Option<String>,
    details: serde_json::Value,
    occurred_at: DateTime<Utc>,
}

impl TryFrom<AuditRow> for AuditEvent {
    type Error = StorageError;

    fn try_from(row: AuditRow) -> StorageResult<Self> {
        Ok(AuditEvent {
            id: row.id,
            notebook_id: row.notebook_id.map(NotebookId::from_uuid),
            actor: author(row.actor)?,
            action: parse("action", &row.action)?,
            outcome: parse("outcome", &row.outcome)?,
            target: row.target,
            details: row.details,
            occurred_at: row.occurred_at,
        })
    }
}

/// Allocates the next sequence of the entry's notebook and inserts the row.
/// Runs on the caller's transaction.
async fn insert_entry(
    conn: &mut PgConnection,
    entry: NewEntry,
    now: DateTime<Utc>,
) -> StorageResult<Entry> {
    let notebook_id = entry.notebook_id;
    let sequence: Option<(i64,)> = sqlx::query_as(
        "UPDATE notebooks SET current_sequence = current_sequence + 1
         WHERE id = $1
         RETURNING current_sequence",
    )
    .bind(notebook_id.as_uuid())
    .fetch_optional(&mut *conn)
    .await
    .map_err(db_err)?;
    let Some((sequence,)) = sequence else {
        return Err(StorageError::not_found(BACKEND, notebook_id));
    };

    let entry = entry.into_entry(sequence, now);
    let refs: Vec<Uuid> = entry.references.iter().map(EntryId::as_uuid).collect();
    let row: EntryRow = sqlx::query_as(
        "INSERT INTO entries (id, notebook_id, content, content_type, content_hash, \
         author_id, signature, sequence, created_at, topic, revision_of, fragment_of, \
         fragment_index, refs)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
         RETURNING *",
    )
    .bind(entry.id.as_uuid())
    .bind(notebook_id.as_uuid())
    .bind(&entry.content)
    .bind(&entry.content_type)
    .bind(&entry.content_hash)
    .bind(entry.author_id.as_str())
    .bind(&entry.signature)
    .bind(sequence)
    .bind(now)
    .bind(&entry.topic)
    .bind(entry.revision_of.map(|id| id.as_uuid()))
    .bind(entry.fragment_of.map(|id| id.as_uuid()))
    .bind(entry.fragment_index)
    .bind(refs)
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| match db_err(e) {
        StorageError::Duplicate { id, .. } if id.contains("sequence") => {
            StorageError::SequenceConflict {
                notebook_id: notebook_id.to_string(),
            }
        }
        other => other,
    })?;
    row.try_into()
}

async fn insert_job(
    conn: &mut PgConnection,
    job: NewJob,
    now: DateTime<Utc>,
) -> StorageResult<Job> {
    let job = Job::from_new(job, now);
    let row: JobRow = sqlx::query_as(
        "INSERT INTO jobs (id, notebook_id, entry_id, job_type, status, payload, created_at, \
         timeout_seconds, retry_count, max_retries, priority)
         VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7, 0, $8, $9)
         RETURNING *",
    )
    .bind(job.id.as_uuid())
    .bind(job.notebook_id.as_uuid())
    .bind(job.entry_id.as_uuid())
    .bind(job.job_type.to_string())
    .bind(&job.payload)
    .bind(job.created_at)
    .bind(job.timeout_seconds)
    .bind(job.max_retries)
    .bind(job.priority)
    .fetch_one(&mut *conn)
    .await
    .map_err(db_err)?;
    row.try_into()
}

// ---------------------------------------------------------------------------
// Stores
// ---------------------------------------------------------------------------

#[async_trait]
impl EntryStore for PostgresBackend {
    #[instrument(skip(self, notebook), fields(notebook_id = %notebook.id))]
    async fn create_notebook(&self, notebook: Notebook) -> StorageResult<Notebook> {
        let compartments: Vec<String> = notebook.compartments.iter().cloned().collect();
        let row: NotebookRow = sqlx::query_as(
            "INSERT INTO notebooks (id, name, owner_id, group_id, classification, compartments, \
             current_sequence, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, 0, $7)
             RETURNING *",
        )
        .bind(notebook.id.as_uuid())
        .bind(&notebook.name)
        .bind(notebook.owner_id.as_str())
        .bind(notebook.group_id.as_ref().map(GroupId::as_str))
        .bind(notebook.classification.map(|c| c.to_string()))
        .bind(compartments)
        .bind(notebook.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        row.try_into()
    }

    async fn get_notebook(&self, id: NotebookId) -> StorageResult<Option<Notebook>> {
        let row: Option<NotebookRow> = sqlx::query_as("SELECT * FROM notebooks WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(Notebook::try_from).transpose()
    }

    #[instrument(skip(self, entry), fields(notebook_id = %entry.notebook_id, entry_id = %entry.id))]
    async fn append_entry(&self, entry: NewEntry) -> StorageResult<Entry> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let entry = insert_entry(&mut tx, entry, self.clock.now()).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(entry)
    }

    #[instrument(skip(self, batch), fields(entries = batch.len()))]
    async fn append_entries_with_jobs(
        &self,
        batch: Vec<(NewEntry, Vec<NewJob>)>,
    ) -> StorageResult<Vec<(Entry, Vec<Job>)>> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut written = Vec::with_capacity(batch.len());
        for (entry, jobs) in batch {
            let entry = insert_entry(&mut tx, entry, now).await?;
            let mut inserted = Vec::with_capacity(jobs.len());
            for job in jobs {
                inserted.push(insert_job(&mut tx, job, now).await?);
            }
            written.push((entry, inserted));
        }
        tx.commit().await.map_err(db_err)?;
        Ok(written)
    }

    async fn get_entry(&self, id: EntryId) -> StorageResult<Option<Entry>> {
        let row: Option<EntryRow> = sqlx::query_as("SELECT * FROM entries WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(Entry::try_from).transpose()
    }

    async fn get_entries(&self, ids: &[EntryId]) -> StorageResult<Vec<Entry>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<Uuid> = ids.iter().map(EntryId::as_uuid).collect();
        let rows: Vec<EntryRow> =
            sqlx::query_as("SELECT * FROM entries WHERE id = ANY($1) ORDER BY sequence")
                .bind(ids)
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?;
        entries(rows)
    }

    async fn entries_after(
        &self,
        notebook_id: NotebookId,
        after: i64,
        limit: usize,
    ) -> StorageResult<Vec<Entry>> {
        let rows: Vec<EntryRow> = sqlx::query_as(
            "SELECT * FROM entries WHERE notebook_id = $1 AND sequence > $2
             ORDER BY sequence ASC LIMIT $3",
        )
        .bind(notebook_id.as_uuid())
        .bind(after)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        entries(rows)
    }

    async fn entries_by_topic(
        &self,
        notebook_id: NotebookId,
        topic: &str,
    ) -> StorageResult<Vec<Entry>> {
        let rows: Vec<EntryRow> = sqlx::query_as(
            "SELECT * FROM entries WHERE notebook_id = $1 AND topic = $2 ORDER BY sequence",
        )
        .bind(notebook_id.as_uuid())
        .bind(topic)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        entries(rows)
    }

    async fn entries_referencing(
        &self,
        notebook_id: NotebookId,
        target: EntryId,
    ) -> StorageResult<Vec<Entry>> {
        let rows: Vec<EntryRow> = sqlx::query_as(
            "SELECT * FROM entries
             WHERE notebook_id = $1 AND ($2 = ANY(refs) OR revision_of = $2)
             ORDER BY sequence",
        )
        .bind(notebook_id.as_uuid())
        .bind(target.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        entries(rows)
    }

    async fn embedded_entries(&self, notebook_id: NotebookId) -> StorageResult<Vec<Entry>> {
        let rows: Vec<EntryRow> = sqlx::query_as(
            "SELECT * FROM entries
             WHERE notebook_id = $1
               AND embedding IS NOT NULL
               AND cardinality(embedding) > 0
               AND claims_status IN ('distilled', 'verified')
             ORDER BY sequence",
        )
        .bind(notebook_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        entries(rows)
    }

    async fn update_claims(
        &self,
        id: EntryId,
        claims: Vec<Claim>,
        status: ClaimsStatus,
        expected_version: i64,
    ) -> StorageResult<Entry> {
        let row: Option<EntryRow> = sqlx::query_as(
            "UPDATE entries SET claims = $2, claims_status = $3, version = version + 1
             WHERE id = $1 AND version = $4
             RETURNING *",
        )
        .bind(id.as_uuid())
        .bind(Json(&claims))
        .bind(status.to_string())
        .bind(expected_version)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        match row {
            Some(row) => row.try_into(),
            None => Err(self.version_miss(id, expected_version).await),
        }
    }

    async fn update_embedding(
        &self,
        id: EntryId,
        embedding: Vec<f32>,
        expected_version: i64,
    ) -> StorageResult<Entry> {
        let row: Option<EntryRow> = sqlx::query_as(
            "UPDATE entries SET embedding = $2, version = version + 1
             WHERE id = $1 AND version = $3
             RETURNING *",
        )
        .bind(id.as_uuid())
        .bind(embedding)
        .bind(expected_version)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        match row {
            Some(row) => row.try_into(),
            None => Err(self.version_miss(id, expected_version).await),
        }
    }

    async fn update_integration(
        &self,
        id: EntryId,
        update: IntegrationUpdate,
        expected_version: i64,
    ) -> StorageResult<Entry> {
        let row: Option<EntryRow> = sqlx::query_as(
            "UPDATE entries SET max_friction = $2, integration_cost = $3, \
             integration_status = $4, needs_review = $5, metric_version = $6, \
             version = version + 1
             WHERE id = $1 AND version = $7
             RETURNING *",
        )
        .bind(id.as_uuid())
        .bind(update.max_friction)
        .bind(Json(&update.cost))
        .bind(update.status.to_string())
        .bind(update.needs_review)
        .bind(&update.metric_version)
        .bind(expected_version)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        match row {
            Some(row) => row.try_into(),
            None => Err(self.version_miss(id, expected_version).await),
        }
    }
}

#[async_trait]
impl JobStore for PostgresBackend {
    #[instrument(skip(self, job), fields(entry_id = %job.entry_id, job_type = %job.job_type))]
    async fn insert_job(&self, job: NewJob) -> StorageResult<Job> {
        let mut conn = self.pool.acquire().await.map_err(db_err)?;
        insert_job(&mut conn, job, self.clock.now()).await
    }

    #[instrument(skip(self, types))]
    async fn claim_next(&self, worker_id: &str, types: &[JobType]) -> StorageResult<Option<Job>> {
        let types: Vec<String> = types.iter().map(ToString::to_string).collect();
        let row: Option<JobRow> = sqlx::query_as(
            "WITH candidate AS (
                SELECT id FROM jobs
                WHERE job_type = ANY($2)
                  AND (status = 'pending'
                       OR (status = 'claimed'
                           AND claimed_at + timeout_seconds * INTERVAL '1 second' <= $3
                           AND retry_count < max_retries))
                ORDER BY priority DESC, created_at ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs SET
                retry_count = CASE WHEN jobs.status = 'claimed'
                                   THEN jobs.retry_count + 1
                                   ELSE jobs.retry_count END,
                status = 'claimed',
                claimed_by = $1,
                claimed_at = $3
            FROM candidate
            WHERE jobs.id = candidate.id
            RETURNING jobs.*",
        )
        .bind(worker_id)
        .bind(types)
        .bind(self.clock.now())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(Job::try_from).transpose()
    }

    #[instrument(skip(self, result))]
    async fn complete_job(
        &self,
        id: JobId,
        worker_id: &str,
        result: serde_json::Value,
    ) -> StorageResult<Job> {
        let row: Option<JobRow> = sqlx::query_as(
            "UPDATE jobs SET status = 'completed', result = $3, error = NULL, completed_at = $4
             WHERE id = $1 AND status = 'claimed' AND claimed_by = $2
             RETURNING *",
        )
        .bind(id.as_uuid())
        .bind(worker_id)
        .bind(result)
        .bind(self.clock.now())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        match row {
            Some(row) => row.try_into(),
            None => Err(self.claim_miss(id, worker_id).await),
        }
    }

    #[instrument(skip(self))]
    async fn fail_job(
        &self,
        id: JobId,
        worker_id: &str,
        error: &str,
    ) -> StorageResult<FailOutcome> {
        let row: Option<JobRow> = sqlx::query_as(
            "UPDATE jobs SET
                error = $3,
                status = CASE WHEN retry_count < max_retries THEN 'pending' ELSE 'failed' END,
                completed_at = CASE WHEN retry_count < max_retries THEN NULL ELSE $4 END,
                retry_count = CASE WHEN retry_count < max_retries
                                   THEN retry_count + 1 ELSE retry_count END,
                claimed_by = NULL,
                claimed_at = NULL
             WHERE id = $1 AND status = 'claimed' AND claimed_by = $2
             RETURNING *",
        )
        .bind(id.as_uuid())
        .bind(worker_id)
        .bind(error)
        .bind(self.clock.now())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        let Some(row) = row else {
            return Err(self.claim_miss(id, worker_id).await);
        };
        let job = Job::try_from(row)?;
        if job.status == JobStatus::Failed {
            Ok(FailOutcome::Exhausted(job))
        } else {
            Ok(FailOutcome::Retrying(job))
        }
    }

    #[instrument(skip(self))]
    async fn reclaim_expired(&self) -> StorageResult<ReclaimReport> {
        let rows: Vec<JobRow> = sqlx::query_as(
            "UPDATE jobs SET
                error = 'claim expired',
                status = CASE WHEN retry_count < max_retries THEN 'pending' ELSE 'failed' END,
                completed_at = CASE WHEN retry_count < max_retries THEN NULL ELSE $1 END,
                retry_count = CASE WHEN retry_count < max_retries
                                   THEN retry_count + 1 ELSE retry_count END,
                claimed_by = NULL,
                claimed_at = NULL
             WHERE status = 'claimed'
               AND claimed_at + timeout_seconds * INTERVAL '1 second' <= $1
             RETURNING *",
        )
        .bind(self.clock.now())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let mut report = ReclaimReport::default();
        for row in rows {
            let job = Job::try_from(row)?;
            if job.status == JobStatus::Failed {
                report.exhausted.push(job);
            } else {
                report.requeued.push(job.id);
            }
        }
        Ok(report)
    }

    async fn get_job(&self, id: JobId) -> StorageResult<Option<Job>> {
        let row: Option<JobRow> = sqlx::query_as("SELECT * FROM jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(Job::try_from).transpose()
    }

    async fn jobs_for_entry(&self, entry_id: EntryId) -> StorageResult<Vec<Job>> {
        let rows: Vec<JobRow> =
            sqlx::query_as("SELECT * FROM jobs WHERE entry_id = $1 ORDER BY created_at, id")
                .bind(entry_id.as_uuid())
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?;
        rows.into_iter().map(Job::try_from).collect()
    }

    async fn job_counts(&self) -> StorageResult<Vec<(JobStatus, i64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM jobs GROUP BY status ORDER BY status")
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?;
        rows.into_iter()
            .map(|(status, count)| -> StorageResult<(JobStatus, i64)> {
                Ok((parse("status", &status)?, count))
            })
            .collect()
    }
}

#[async_trait]
impl MirrorStore for PostgresBackend {
    async fn create_subscription(
        &self,
        subscription: Subscription,
    ) -> StorageResult<Subscription> {
        let row: SubscriptionRow = sqlx::query_as(
            "INSERT INTO subscriptions (id, source_notebook_id, target_notebook_id, filter, \
             watermark, created_by, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING *",
        )
        .bind(subscription.id.as_uuid())
        .bind(subscription.source_notebook_id.as_uuid())
        .bind(subscription.target_notebook_id.as_uuid())
        .bind(Json(&subscription.filter))
        .bind(subscription.watermark)
        .bind(subscription.created_by.as_str())
        .bind(subscription.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        row.try_into()
    }

    async fn get_subscription(&self, id: SubscriptionId) -> StorageResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> =
            sqlx::query_as("SELECT * FROM subscriptions WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        row.map(Subscription::try_from).transpose()
    }

    async fn list_subscriptions(&self) -> StorageResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> =
            sqlx::query_as("SELECT * FROM subscriptions ORDER BY created_at, id")
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?;
        rows.into_iter().map(Subscription::try_from).collect()
    }

    #[instrument(skip(self, mirrors), fields(count = mirrors.len()))]
    async fn apply_mirrors(
        &self,
        subscription_id: SubscriptionId,
        mirrors: Vec<MirroredClaim>,
        expected_watermark: i64,
        new_watermark: i64,
    ) -> StorageResult<bool> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let moved = sqlx::query(
            "UPDATE subscriptions SET watermark = $3 WHERE id = $1 AND watermark = $2",
        )
        .bind(subscription_id.as_uuid())
        .bind(expected_watermark)
        .bind(new_watermark)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        if moved.rows_affected() == 0 {
            tx.rollback().await.map_err(db_err)?;
            return Ok(false);
        }

        for mirror in mirrors {
            // Orders this upsert against a concurrent retraction of the entry.
            sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
                .bind(mirror.source_entry_id.to_string())
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;

            sqlx::query(
                "INSERT INTO mirrored_claims (subscription_id, source_entry_id, \
                 source_notebook_id, claims, topic, embedding, source_sequence, tombstoned, \
                 mirrored_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7,
                         $8 OR EXISTS (SELECT 1 FROM retracted_entries WHERE entry_id = $2),
                         $9)
                 ON CONFLICT (subscription_id, source_entry_id) DO UPDATE SET
                     claims = EXCLUDED.claims,
                     topic = EXCLUDED.topic,
                     embedding = EXCLUDED.embedding,
                     source_sequence = EXCLUDED.source_sequence,
                     tombstoned = EXCLUDED.tombstoned,
                     mirrored_at = EXCLUDED.mirrored_at
                 WHERE mirrored_claims.tombstoned = FALSE",
            )
            .bind(subscription_id.as_uuid())
            .bind(mirror.source_entry_id.as_uuid())
            .bind(mirror.source_notebook_id.as_uuid())
            .bind(Json(&mirror.claims))
            .bind(&mirror.topic)
            .bind(&mirror.embedding)
            .bind(mirror.source_sequence)
            .bind(mirror.tombstoned)
            .bind(mirror.mirrored_at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }

    #[instrument(skip(self))]
    async fn tombstone_source_entry(&self, entry_id: EntryId) -> StorageResult<u64> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(entry_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        sqlx::query(
            "INSERT INTO retracted_entries (entry_id, retracted_at) VALUES ($1, $2)
             ON CONFLICT (entry_id) DO NOTHING",
        )
        .bind(entry_id.as_uuid())
        .bind(self.clock.now())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        let result = sqlx::query(
            "UPDATE mirrored_claims SET tombstoned = TRUE
             WHERE source_entry_id = $1 AND tombstoned = FALSE",
        )
        .bind(entry_id.as_uuid())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn is_retracted(&self, entry_id: EntryId) -> StorageResult<bool> {
        let row: Option<(Uuid,)> =
            sqlx::query_as("SELECT entry_id FROM retracted_entries WHERE entry_id = $1")
                .bind(entry_id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(row.is_some())
    }

    async fn list_mirrors(
        &self,
        target: NotebookId,
        include_tombstoned: bool,
    ) -> StorageResult<Vec<MirroredClaim>> {
        let rows: Vec<MirrorRow> = sqlx::query_as(
            "SELECT m.* FROM mirrored_claims m
             JOIN subscriptions s ON s.id = m.subscription_id
             WHERE s.target_notebook_id = $1 AND ($2 OR NOT m.tombstoned)
             ORDER BY m.subscription_id, m.source_sequence",
        )
        .bind(target.as_uuid())
        .bind(include_tombstoned)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(rows.into_iter().map(MirroredClaim::from).collect())
    }
}

#[async_trait]
impl AccessStore for PostgresBackend {
    async fn get_grant(
        &self,
        notebook_id: NotebookId,
        author_id: &AuthorId,
    ) -> StorageResult<Option<AccessGrant>> {
        let row: Option<GrantRow> = sqlx::query_as(
            "SELECT * FROM access_grants WHERE notebook_id = $1 AND author_id = $2",
        )
        .bind(notebook_id.as_uuid())
        .bind(author_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|row| -> StorageResult<AccessGrant> {
            Ok(AccessGrant {
                notebook_id: NotebookId::from_uuid(row.notebook_id),
                author_id: author(row.author_id)?,
                read: row.can_read,
                write: row.can_write,
                admin: row.can_admin,
                granted_by: author(row.granted_by)?,
                granted_at: row.granted_at,
            })
        })
        .transpose()
    }

    async fn put_grant(&self, grant: AccessGrant) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO access_grants (notebook_id, author_id, can_read, can_write, can_admin, \
             granted_by, granted_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (notebook_id, author_id) DO UPDATE SET
                 can_read = EXCLUDED.can_read,
                 can_write = EXCLUDED.can_write,
                 can_admin = EXCLUDED.can_admin,
                 granted_by = EXCLUDED.granted_by,
                 granted_at = EXCLUDED.granted_at",
        )
        .bind(grant.notebook_id.as_uuid())
        .bind(grant.author_id.as_str())
        .bind(grant.read)
        .bind(grant.write)
        .bind(grant.admin)
        .bind(grant.granted_by.as_str())
        .bind(grant.granted_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn delete_grant(
        &self,
        notebook_id: NotebookId,
        author_id: &AuthorId,
    ) -> StorageResult<bool> {
        let result =
            sqlx::query("DELETE FROM access_grants WHERE notebook_id = $1 AND author_id = $2")
                .bind(notebook_id.as_uuid())
                .bind(author_id.as_str())
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_membership(
        &self,
        group_id: &GroupId,
        author_id: &AuthorId,
    ) -> StorageResult<Option<GroupMembership>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT role FROM group_memberships WHERE group_id = $1 AND author_id = $2",
        )
        .bind(group_id.as_str())
        .bind(author_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(|(role,)| -> StorageResult<GroupMembership> {
            Ok(GroupMembership {
                group_id: group_id.clone(),
                author_id: author_id.clone(),
                role: parse("role", &role)?,
            })
        })
        .transpose()
    }

    async fn put_membership(&self, membership: GroupMembership) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO group_memberships (group_id, author_id, role) VALUES ($1, $2, $3)
             ON CONFLICT (group_id, author_id) DO UPDATE SET role = EXCLUDED.role",
        )
        .bind(membership.group_id.as_str())
        .bind(membership.author_id.as_str())
        .bind(membership.role.to_string())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_members(&self, group_id: &GroupId) -> StorageResult<Vec<GroupMembership>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT author_id, role FROM group_memberships WHERE group_id = $1 ORDER BY author_id",
        )
        .bind(group_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter()
            .map(|(author_id, role)| -> StorageResult<GroupMembership> {
                Ok(GroupMembership {
                    group_id: group_id.clone(),
                    author_id: author(author_id)?,
                    role: parse("role", &role)?,
                })
            })
            .collect()
    }

    async fn get_clearance(&self, author_id: &AuthorId) -> StorageResult<Option<Clearance>> {
        let row: Option<(String, Vec<String>)> =
            sqlx::query_as("SELECT level, compartments FROM clearances WHERE author_id = $1")
                .bind(author_id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        row.map(|(level, compartments)| -> StorageResult<Clearance> {
            Ok(Clearance {
                author_id: author_id.clone(),
                level: parse("level", &level)?,
                compartments: compartments.into_iter().collect(),
            })
        })
        .transpose()
    }

    async fn put_clearance(&self, clearance: Clearance) -> StorageResult<()> {
        let compartments: Vec<String> = clearance.compartments.iter().cloned().collect();
        sqlx::query(
            "INSERT INTO clearances (author_id, level, compartments) VALUES ($1, $2, $3)
             ON CONFLICT (author_id) DO UPDATE SET
                 level = EXCLUDED.level,
                 compartments = EXCLUDED.compartments",
        )
        .bind(clearance.author_id.as_str())
        .bind(clearance.level.to_string())
        .bind(compartments)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl AuditStore for PostgresBackend {
    async fn append_audit(&self, events: &[AuditEvent]) -> StorageResult<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for event in events {
            sqlx::query(
                "INSERT INTO audit_log (id, notebook_id, actor, action, outcome, target, \
                 details, occurred_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 ON CONFLICT (id) DO NOTHING",
            )
            .bind(event.id)
            .bind(event.notebook_id.map(|id| id.as_uuid()))
            .bind(event.actor.as_str())
            .bind(event.action.to_string())
            .bind(event.outcome.to_string())
            .bind(&event.target)
            .bind(&event.details)
            .bind(event.occurred_at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn list_audit(
        &self,
        notebook_id: Option<NotebookId>,
        limit: usize,
    ) -> StorageResult<Vec<AuditEvent>> {
        let rows: Vec<AuditRow> = sqlx::query_as(
            "SELECT * FROM audit_log
             WHERE ($1::uuid IS NULL OR notebook_id = $1)
             ORDER BY occurred_at DESC
             LIMIT $2",
        )
        .bind(notebook_id.map(|id| id.as_uuid()))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.into_iter().map(AuditEvent::try_from).collect()
    }
}
