//! In-process backend implementing every store trait.
//!
//! All state sits behind one mutex so multi-row operations (sequence
//! allocation, job claim, watermark move plus mirror upsert) are atomic the
//! same way a database transaction makes them atomic.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use errors::StorageError;
use nb_core::{
    AccessGrant, AccessStore, AuditEvent, AuditStore, AuthorId, Claim, ClaimsStatus, Clearance,
    Clock, Entry, EntryId, EntryStore, FailOutcome, GroupId, GroupMembership, IntegrationUpdate,
    Job, JobId, JobStatus, JobStore, JobType, MirrorStore, MirroredClaim, NewEntry, NewJob,
    Notebook, NotebookId, ReclaimReport, StorageResult, Subscription, SubscriptionId,
    SystemClock,
};
use parking_lot::Mutex;

const BACKEND: &str = "memory";

#[derive(Default)]
struct State {
    notebooks: HashMap<NotebookId, Notebook>,
    entries: HashMap<EntryId, Entry>,
    by_sequence: BTreeMap<(NotebookId, i64), EntryId>,
    jobs: HashMap<JobId, Job>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    mirrors: BTreeMap<(SubscriptionId, i64, EntryId), MirroredClaim>,
    retracted: HashSet<EntryId>,
    grants: HashMap<(NotebookId, AuthorId), AccessGrant>,
    memberships: HashMap<(GroupId, AuthorId), GroupMembership>,
    clearances: HashMap<AuthorId, Clearance>,
    audit: Vec<AuditEvent>,
}

pub struct InMemoryBackend {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
        }
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBackend").finish_non_exhaustive()
    }
}

fn versioned_entry<'a>(
    state: &'a mut State,
    id: EntryId,
    expected_version: i64,
) -> StorageResult<&'a mut Entry> {
    let entry = state
        .entries
        .get_mut(&id)
        .ok_or_else(|| StorageError::not_found(BACKEND, id))?;
    if entry.version != expected_version {
        return Err(StorageError::VersionConflict {
            entity: "entry".to_string(),
            id: id.to_string(),
            expected: expected_version,
        });
    }
    entry.version += 1;
    Ok(entry)
}

fn held_job<'a>(state: &'a mut State, id: JobId, worker_id: &str) -> StorageResult<&'a mut Job> {
    let job = state
        .jobs
        .get_mut(&id)
        .ok_or_else(|| StorageError::not_found(BACKEND, id))?;
    if !job.is_held_by(worker_id) {
        return Err(StorageError::StaleClaim {
            job_id: id.to_string(),
            worker_id: worker_id.to_string(),
        });
    }
    Ok(job)
}

#[async_trait]
impl EntryStore for InMemoryBackend {
    async fn create_notebook(&self, notebook: Notebook) -> StorageResult<Notebook> {
        let mut state = self.state.lock();
        if state.notebooks.contains_key(&notebook.id) {
            return Err(StorageError::Duplicate {
                entity: "notebook".to_string(),
                id: notebook.id.to_string(),
            });
        }
        state.notebooks.insert(notebook.id, notebook.clone());
        Ok(notebook)
    }

    async fn get_notebook(&self, id: NotebookId) -> StorageResult<Option<Notebook>> {
        Ok(self.state.lock().notebooks.get(&id).cloned())
    }

    async fn append_entry(&self, entry: NewEntry) -> StorageResult<Entry> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        if state.entries.contains_key(&entry.id) {
            return Err(StorageError::Duplicate {
                entity: "entry".to_string(),
                id: entry.id.to_string(),
            });
        }
        let notebook = state
            .notebooks
            .get_mut(&entry.notebook_id)
            .ok_or_else(|| StorageError::not_found(BACKEND, entry.notebook_id))?;
        notebook.current_sequence += 1;
        let sequence = notebook.current_sequence;

        let entry = entry.into_entry(sequence, now);
        state
            .by_sequence
            .insert((entry.notebook_id, sequence), entry.id);
        state.entries.insert(entry.id, entry.clone());
        Ok(entry)
    }

    async fn append_entries_with_jobs(
        &self,
        batch: Vec<(NewEntry, Vec<NewJob>)>,
    ) -> StorageResult<Vec<(Entry, Vec<Job>)>> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        for (entry, _) in &batch {
            if state.entries.contains_key(&entry.id) {
                return Err(StorageError::Duplicate {
                    entity: "entry".to_string(),
                    id: entry.id.to_string(),
                });
            }
            if !state.notebooks.contains_key(&entry.notebook_id) {
                return Err(StorageError::not_found(BACKEND, entry.notebook_id));
            }
        }

        let mut written = Vec::with_capacity(batch.len());
        for (entry, jobs) in batch {
            let Some(notebook) = state.notebooks.get_mut(&entry.notebook_id) else {
                return Err(StorageError::not_found(BACKEND, entry.notebook_id));
            };
            notebook.current_sequence += 1;
            let entry = entry.into_entry(notebook.current_sequence, now);
            state
                .by_sequence
                .insert((entry.notebook_id, entry.sequence), entry.id);
            state.entries.insert(entry.id, entry.clone());

            let jobs: Vec<Job> = jobs.into_iter().map(|job| Job::from_new(job, now)).collect();
            for job in &jobs {
                state.jobs.insert(job.id, job.clone());
            }
            written.push((entry, jobs));
        }
        Ok(written)
    }

    async fn get_entry(&self, id: EntryId) -> StorageResult<Option<Entry>> {
        Ok(self.state.lock().entries.get(&id).cloned())
    }

    async fn get_entries(&self, ids: &[EntryId]) -> StorageResult<Vec<Entry>> {
        let state = self.state.lock();
        Ok(ids
            .iter()
            .filter_map(|id| state.entries.get(id).cloned())
            .collect())
    }

    async fn entries_after(
        &self,
        notebook_id: NotebookId,
        after: i64,
        limit: usize,
    ) -> StorageResult<Vec<Entry>> {
        let state = self.state.lock();
        Ok(state
            .by_sequence
            .range((notebook_id, after + 1)..=(notebook_id, i64::MAX))
            .take(limit)
            .filter_map(|(_, id)| state.entries.get(id).cloned())
            .collect())
    }

    async fn entries_by_topic(
        &self,
        notebook_id: NotebookId,
        topic: &str,
    ) -> StorageResult<Vec<Entry>> {
        let state = self.state.lock();
        let mut entries: Vec<Entry> = state
            .entries
            .values()
            .filter(|e| e.notebook_id == notebook_id && e.topic.as_deref() == Some(topic))
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.sequence);
        Ok(entries)
    }

    async fn entries_referencing(
        &self,
        notebook_id: NotebookId,
        target: EntryId,
    ) -> StorageResult<Vec<Entry>> {
        let state = self.state.lock();
        let mut entries: Vec<Entry> = state
            .entries
            .values()
            .filter(|e| {
                e.notebook_id == notebook_id
                    && (e.references.contains(&target) || e.revision_of == Some(target))
            })
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.sequence);
        Ok(entries)
    }

    async fn embedded_entries(&self, notebook_id: NotebookId) -> StorageResult<Vec<Entry>> {
        let state = self.state.lock();
        let mut entries: Vec<Entry> = state
            .entries
            .values()
            .filter(|e| e.notebook_id == notebook_id && e.is_ready_for_integration())
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.sequence);
        Ok(entries)
    }

    async fn update_claims(
        &self,
        id: EntryId,
        claims: Vec<Claim>,
        status: ClaimsStatus,
        expected_version: i64,
    ) -> StorageResult<Entry> {
        let mut state = self.state.lock();
        let entry = versioned_entry(&mut state, id, expected_version)?;
        entry.claims = claims;
        entry.claims_status = status;
        Ok(entry.clone())
    }

    async fn update_embedding(
        &self,
        id: EntryId,
        embedding: Vec<f32>,
        expected_version: i64,
    ) -> StorageResult<Entry> {
        let mut state = self.state.lock();
        let entry = versioned_entry(&mut state, id, expected_version)?;
        entry.embedding = Some(embedding);
        Ok(entry.clone())
    }

    async fn update_integration(
        &self,
        id: EntryId,
        update: IntegrationUpdate,
        expected_version: i64,
    ) -> StorageResult<Entry> {
        let mut state = self.state.lock();
        let entry = versioned_entry(&mut state, id, expected_version)?;
        entry.max_friction = Some(update.max_friction);
        entry.integration_cost = Some(update.cost);
        entry.integration_status = update.status;
        entry.needs_review = update.needs_review;
        entry.metric_version = Some(update.metric_version);
        Ok(entry.clone())
    }
}

#[async_trait]
impl JobStore for InMemoryBackend {
    async fn insert_job(&self, job: NewJob) -> StorageResult<Job> {
        let job = Job::from_new(job, self.clock.now());
        self.state.lock().jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn claim_next(&self, worker_id: &str, types: &[JobType]) -> StorageResult<Option<Job>> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let best = state
            .jobs
            .values()
            .filter(|job| types.contains(&job.job_type) && job.is_claimable(now))
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.created_at.cmp(&b.created_at))
                    .then(a.id.cmp(&b.id))
            })
            .map(|job| job.id);

        let Some(id) = best else {
            return Ok(None);
        };
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };
        job.take_claim(worker_id, now);
        Ok(Some(job.clone()))
    }

    async fn complete_job(
        &self,
        id: JobId,
        worker_id: &str,
        result: serde_json::Value,
    ) -> StorageResult<Job> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let job = held_job(&mut state, id, worker_id)?;
        job.status = JobStatus::Completed;
        job.result = Some(result);
        job.error = None;
        job.completed_at = Some(now);
        Ok(job.clone())
    }

    async fn fail_job(
        &self,
        id: JobId,
        worker_id: &str,
        error: &str,
    ) -> StorageResult<FailOutcome> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let job = held_job(&mut state, id, worker_id)?;
        if job.record_failure(error, now) {
            Ok(FailOutcome::Retrying(job.clone()))
        } else {
            Ok(FailOutcome::Exhausted(job.clone()))
        }
    }

    async fn reclaim_expired(&self) -> StorageResult<ReclaimReport> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let mut report = ReclaimReport::default();
        for job in state.jobs.values_mut() {
            if !job.is_claim_expired(now) {
                continue;
            }
            if job.record_failure("claim expired", now) {
                report.requeued.push(job.id);
            } else {
                report.exhausted.push(job.clone());
            }
        }
        Ok(report)
    }

    async fn get_job(&self, id: JobId) -> StorageResult<Option<Job>> {
        Ok(self.state.lock().jobs.get(&id).cloned())
    }

    async fn jobs_for_entry(&self, entry_id: EntryId) -> StorageResult<Vec<Job>> {
        let state = self.state.lock();
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| j.entry_id == entry_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    async fn job_counts(&self) -> StorageResult<Vec<(JobStatus, i64)>> {
        let state = self.state.lock();
        let mut counts: HashMap<JobStatus, i64> = HashMap::new();
        for job in state.jobs.values() {
            *counts.entry(job.status).or_default() += 1;
        }
        let mut counts: Vec<(JobStatus, i64)> = counts.into_iter().collect();
        counts.sort_by_key(|(status, _)| status.to_string());
        Ok(counts)
    }
}

#[async_trait]
impl MirrorStore for InMemoryBackend {
    async fn create_subscription(
        &self,
        subscription: Subscription,
    ) -> StorageResult<Subscription> {
        let mut state = self.state.lock();
        if state.subscriptions.contains_key(&subscription.id) {
            return Err(StorageError::Duplicate {
                entity: "subscription".to_string(),
                id: subscription.id.to_string(),
            });
        }
        state
            .subscriptions
            .insert(subscription.id, subscription.clone());
        Ok(subscription)
    }

    async fn get_subscription(&self, id: SubscriptionId) -> StorageResult<Option<Subscription>> {
        Ok(self.state.lock().subscriptions.get(&id).cloned())
    }

    async fn list_subscriptions(&self) -> StorageResult<Vec<Subscription>> {
        let state = self.state.lock();
        let mut subscriptions: Vec<Subscription> =
            state.subscriptions.values().cloned().collect();
        subscriptions.sort_by_key(|s| s.created_at);
        Ok(subscriptions)
    }

    async fn apply_mirrors(
        &self,
        subscription_id: SubscriptionId,
        mirrors: Vec<MirroredClaim>,
        expected_watermark: i64,
        new_watermark: i64,
    ) -> StorageResult<bool> {
        let mut state = self.state.lock();
        let State {
            subscriptions,
            mirrors: stored,
            retracted,
            ..
        } = &mut *state;
        let subscription = subscriptions
            .get_mut(&subscription_id)
            .ok_or_else(|| StorageError::not_found(BACKEND, subscription_id))?;
        if subscription.watermark != expected_watermark {
            return Ok(false);
        }
        subscription.watermark = new_watermark;

        for mut mirror in mirrors {
            if retracted.contains(&mirror.source_entry_id) {
                mirror.tombstoned = true;
            }
            let key = (
                subscription_id,
                mirror.source_sequence,
                mirror.source_entry_id,
            );
            if stored.get(&key).is_some_and(|existing| existing.tombstoned) {
                continue;
            }
            stored.insert(key, mirror);
        }
        Ok(true)
    }

    async fn tombstone_source_entry(&self, entry_id: EntryId) -> StorageResult<u64> {
        let mut state = self.state.lock();
        state.retracted.insert(entry_id);
        let mut count = 0;
        for mirror in state.mirrors.values_mut() {
            if mirror.source_entry_id == entry_id && !mirror.tombstoned {
                mirror.tombstoned = true;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn is_retracted(&self, entry_id: EntryId) -> StorageResult<bool> {
        Ok(self.state.lock().retracted.contains(&entry_id))
    }

    async fn list_mirrors(
        &self,
        target: NotebookId,
        include_tombstoned: bool,
    ) -> StorageResult<Vec<MirroredClaim>> {
        let state = self.state.lock();
        let subscriptions: HashSet<SubscriptionId> = state
            .subscriptions
            .values()
            .filter(|s| s.target_notebook_id == target)
            .map(|s| s.id)
            .collect();
        Ok(state
            .mirrors
            .iter()
            .filter(|((sub, _, _), m)| {
                subscriptions.contains(sub) && (include_tombstoned || !m.tombstoned)
            })
            .map(|(_, m)| m.clone())
            .collect())
    }
}

#[async_trait]
impl AccessStore for InMemoryBackend {
    async fn get_grant(
        &self,
        notebook_id: NotebookId,
        author_id: &AuthorId,
    ) -> StorageResult<Option<AccessGrant>> {
        Ok(self
            .state
            .lock()
            .grants
            .get(&(notebook_id, author_id.clone()))
            .cloned())
    }

    async fn put_grant(&self, grant: AccessGrant) -> StorageResult<()> {
        self.state
            .lock()
            .grants
            .insert((grant.notebook_id, grant.author_id.clone()), grant);
        Ok(())
    }

    async fn delete_grant(
        &self,
        notebook_id: NotebookId,
        author_id: &AuthorId,
    ) -> StorageResult<bool> {
        Ok(self
            .state
            .lock()
            .grants
            .remove(&(notebook_id, author_id.clone()))
            .is_some())
    }

    async fn get_membership(
        &self,
        group_id: &GroupId,
        author_id: &AuthorId,
    ) -> StorageResult<Option<GroupMembership>> {
        Ok(self
            .state
            .lock()
            .memberships
            .get(&(group_id.clone(), author_id.clone()))
            .cloned())
    }

    async fn put_membership(&self, membership: GroupMembership) -> StorageResult<()> {
        self.state.lock().memberships.insert(
            (membership.group_id.clone(), membership.author_id.clone()),
            membership,
        );
        Ok(())
    }

    async fn list_members(&self, group_id: &GroupId) -> StorageResult<Vec<GroupMembership>> {
        let state = self.state.lock();
        let mut members: Vec<GroupMembership> = state
            .memberships
            .values()
            .filter(|m| &m.group_id == group_id)
            .cloned()
            .collect();
        members.sort_by(|a, b| a.author_id.as_str().cmp(b.author_id.as_str()));
        Ok(members)
    }

    async fn get_clearance(&self, author_id: &AuthorId) -> StorageResult<Option<Clearance>> {
        Ok(self.state.lock().clearances.get(author_id).cloned())
    }

    async fn put_clearance(&self, clearance: Clearance) -> StorageResult<()> {
        self.state
            .lock()
            .clearances
            .insert(clearance.author_id.clone(), clearance);
        Ok(())
    }
}

#[async_trait]
impl AuditStore for InMemoryBackend {
    async fn append_audit(&self, events: &[AuditEvent]) -> StorageResult<()> {
        self.state.lock().audit.extend_from_slice(events);
        Ok(())
    }

    async fn list_audit(
        &self,
        notebook_id: Option<NotebookId>,
        limit: usize,
    ) -> StorageResult<Vec<AuditEvent>> {
        let state = self.state.lock();
        let mut events: Vec<AuditEvent> = state
            .audit
            .iter()
            .filter(|e| notebook_id.is_none() || e.notebook_id == notebook_id)
            .cloned()
            .collect();
        events.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at));
        events.truncate(limit);
        Ok(events)
    }
}
