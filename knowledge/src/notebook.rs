//! Notebook service: the external-facing operations.
//!
//! Every mutating entry point checks the caller's tier before any side
//! effect, job enqueue included, and records the outcome in the audit log.

use std::collections::BTreeSet;
use std::sync::Arc;

use config::Config;
use errors::{NotebookError, Result};
use nb_core::{
    AccessGrant, AuditAction, AuditEvent, AuditOutcome, AuthorId, Claim, Classification,
    Clearance, Clock, Entry, EntryId, FailOutcome, GroupId, GroupMembership, GroupRole, Job,
    JobId, JobStatus, JobType, NewEntry, Notebook, NotebookId, NotebookStore, ReclaimReport,
    SystemClock, Tier,
};
use observability::AuditSink;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, instrument};

use crate::access::AccessControl;
use crate::events::{EventBus, NotebookEvent};
use crate::integration::IntegrationEngine;
use crate::ledger::JobLedger;
use crate::pipeline::Pipeline;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateNotebook {
    pub name: String,
    #[serde(default)]
    pub group_id: Option<GroupId>,
    #[serde(default)]
    pub classification: Option<Classification>,
    #[serde(default)]
    pub compartments: BTreeSet<String>,
}

impl CreateNotebook {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteEntry {
    pub content: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub references: Vec<EntryId>,
}

impl WriteEntry {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            content_type: None,
            signature: String::new(),
            topic: None,
            references: Vec::new(),
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn with_references(mut self, references: Vec<EntryId>) -> Self {
        self.references = references;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
    pub admin: bool,
}

impl Permissions {
    pub const READ: Permissions = Permissions {
        read: true,
        write: false,
        admin: false,
    };
    pub const WRITE: Permissions = Permissions {
        read: true,
        write: true,
        admin: false,
    };
    pub const ADMIN: Permissions = Permissions {
        read: true,
        write: true,
        admin: true,
    };
}

/// Entries created by one write, head first, and the jobs enqueued for them.
#[derive(Debug, Clone)]
pub struct WriteReceipt {
    pub entries: Vec<Entry>,
    pub jobs: Vec<JobId>,
}

impl WriteReceipt {
    pub fn head(&self) -> &Entry {
        &self.entries[0]
    }

    pub fn sequence(&self) -> i64 {
        self.head().sequence
    }
}

/// Splits `content` into pieces of at most `max_bytes`, never inside a
/// UTF-8 sequence. A character wider than `max_bytes` gets a piece of its
/// own.
pub fn split_fragments(content: &str, max_bytes: usize) -> Vec<&str> {
    let max_bytes = max_bytes.max(1);
    let mut pieces = Vec::new();
    let mut start = 0;
    while start < content.len() {
        let mut end = (start + max_bytes).min(content.len());
        while !content.is_char_boundary(end) {
            end -= 1;
        }
        if end == start {
            end = start + 1;
            while !content.is_char_boundary(end) {
                end += 1;
            }
        }
        pieces.push(&content[start..end]);
        start = end;
    }
    pieces
}

pub struct NotebookService {
    store: Arc<dyn NotebookStore>,
    access: AccessControl,
    pipeline: Arc<Pipeline>,
    audit: AuditSink,
    events: EventBus,
    clock: Arc<dyn Clock>,
    max_fragment_bytes: usize,
    sequence_retries: usize,
}

impl NotebookService {
    pub fn new(
        store: Arc<dyn NotebookStore>,
        config: &Config,
        audit: AuditSink,
        events: EventBus,
    ) -> Self {
        let ledger = JobLedger::new(store.clone(), config.jobs.clone());
        let engine = IntegrationEngine::new(
            store.clone(),
            ledger.clone(),
            events.clone(),
            config.integration.clone(),
        );
        let pipeline = Arc::new(Pipeline::new(store.clone(), ledger, engine));
        Self {
            access: AccessControl::new(store.clone()),
            store,
            pipeline,
            audit,
            events,
            clock: Arc::new(SystemClock),
            max_fragment_bytes: config.entries.max_fragment_bytes,
            sequence_retries: config.entries.sequence_retries,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.access = self.access.with_clock(clock.clone());
        self.clock = clock;
        self
    }

    pub fn access(&self) -> &AccessControl {
        &self.access
    }

    pub fn pipeline(&self) -> Arc<Pipeline> {
        Arc::clone(&self.pipeline)
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn record(
        &self,
        actor: &AuthorId,
        action: AuditAction,
        notebook_id: Option<NotebookId>,
        target: Option<String>,
        details: serde_json::Value,
    ) {
        let mut event =
            AuditEvent::new(actor.clone(), action, AuditOutcome::Allowed, self.clock.now())
                .with_details(details);
        if let Some(notebook_id) = notebook_id {
            event = event.on_notebook(notebook_id);
        }
        if let Some(target) = target {
            event = event.with_target(target);
        }
        self.audit.record(event);
    }

    fn deny(&self, actor: &AuthorId, action: AuditAction, err: NotebookError) -> NotebookError {
        self.audit.record(
            AuditEvent::new(actor.clone(), action, AuditOutcome::Denied, self.clock.now())
                .with_details(json!({ "reason": err.to_string() })),
        );
        err
    }

    async fn authorize(
        &self,
        actor: &AuthorId,
        notebook_id: NotebookId,
        required: Tier,
        action: AuditAction,
    ) -> Result<Notebook> {
        self.access
            .authorize(&self.audit, action, notebook_id, actor, required)
            .await
    }

    async fn entry(&self, entry_id: EntryId) -> Result<Entry> {
        self.store
            .get_entry(entry_id)
            .await?
            .ok_or_else(|| NotebookError::not_found("entry", entry_id))
    }

    // -----------------------------------------------------------------------
    // Notebooks and access
    // -----------------------------------------------------------------------

    /// Creates a notebook owned by `owner`. Labels require the owner to hold
    /// a clearance covering them.
    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn create_notebook(
        &self,
        owner: &AuthorId,
        request: CreateNotebook,
    ) -> Result<Notebook> {
        let name = request.name.trim();
        if name.is_empty() {
            return Err(NotebookError::invalid("name", "must not be empty"));
        }

        let mut notebook = Notebook::new(name, owner.clone(), self.clock.now());
        notebook.group_id = request.group_id;
        notebook.classification = request.classification;
        notebook.compartments = request.compartments;

        if notebook.is_labelled() {
            let clearance = self.store.get_clearance(owner).await?;
            if !clearance.as_ref().is_some_and(|c| c.covers(&notebook)) {
                let err = NotebookError::Denied {
                    notebook: notebook.id.to_string(),
                    author: owner.to_string(),
                    required: "clearance".to_string(),
                    effective: clearance
                        .map_or_else(|| "none".to_string(), |c| c.level.to_string()),
                };
                return Err(self.deny(owner, AuditAction::CreateNotebook, err));
            }
        }

        let notebook = self.store.create_notebook(notebook).await?;
        info!(notebook_id = %notebook.id, owner = %owner, "Created notebook");
        self.record(
            owner,
            AuditAction::CreateNotebook,
            Some(notebook.id),
            Some(notebook.name.clone()),
            json!({ "classification": notebook.classification, "group_id": notebook.group_id }),
        );
        Ok(notebook)
    }

    pub async fn get_notebook(&self, actor: &AuthorId, notebook_id: NotebookId) -> Result<Notebook> {
        self.access.require_read(notebook_id, actor).await
    }

    pub async fn effective_tier(&self, actor: &AuthorId, notebook_id: NotebookId) -> Result<Tier> {
        Ok(self.access.tier_for(notebook_id, actor).await?.1)
    }

    /// Grants `grantee` the given permissions. Conferring admin requires the
    /// owner.
    #[instrument(skip(self))]
    pub async fn share(
        &self,
        actor: &AuthorId,
        notebook_id: NotebookId,
        grantee: &AuthorId,
        permissions: Permissions,
    ) -> Result<AccessGrant> {
        let required = if permissions.admin {
            Tier::Owner
        } else {
            Tier::Admin
        };
        self.authorize(actor, notebook_id, required, AuditAction::ShareNotebook)
            .await?;

        let grant = AccessGrant {
            notebook_id,
            author_id: grantee.clone(),
            read: permissions.read || permissions.write || permissions.admin,
            write: permissions.write || permissions.admin,
            admin: permissions.admin,
            granted_by: actor.clone(),
            granted_at: self.clock.now(),
        };
        self.store.put_grant(grant.clone()).await?;
        self.record(
            actor,
            AuditAction::ShareNotebook,
            Some(notebook_id),
            Some(grantee.to_string()),
            json!({ "tier": grant.tier() }),
        );
        Ok(grant)
    }

    #[instrument(skip(self))]
    pub async fn revoke(
        &self,
        actor: &AuthorId,
        notebook_id: NotebookId,
        grantee: &AuthorId,
    ) -> Result<bool> {
        self.authorize(actor, notebook_id, Tier::Admin, AuditAction::RevokeGrant)
            .await?;
        let removed = self.store.delete_grant(notebook_id, grantee).await?;
        self.record(
            actor,
            AuditAction::RevokeGrant,
            Some(notebook_id),
            Some(grantee.to_string()),
            json!({ "removed": removed }),
        );
        Ok(removed)
    }

    /// Assigns a clearance. The actor's own clearance must dominate the one
    /// assigned.
    #[instrument(skip(self, clearance), fields(author = %clearance.author_id, level = %clearance.level))]
    pub async fn set_clearance(&self, actor: &AuthorId, clearance: Clearance) -> Result<()> {
        let own = self.store.get_clearance(actor).await?;
        let dominates = own.as_ref().is_some_and(|c| {
            c.level >= clearance.level && clearance.compartments.is_subset(&c.compartments)
        });
        if !dominates {
            let err = NotebookError::Denied {
                notebook: "none".to_string(),
                author: actor.to_string(),
                required: clearance.level.to_string(),
                effective: own.map_or_else(|| "none".to_string(), |c| c.level.to_string()),
            };
            return Err(self.deny(actor, AuditAction::SetClearance, err));
        }

        let target = clearance.author_id.to_string();
        let details = json!({ "level": clearance.level, "compartments": clearance.compartments });
        self.store.put_clearance(clearance).await?;
        self.record(actor, AuditAction::SetClearance, None, Some(target), details);
        Ok(())
    }

    /// Adds or re-roles a group member. Requires a maintainer of the group;
    /// the first member of an empty group may enrol themselves as
    /// maintainer.
    #[instrument(skip(self))]
    pub async fn add_member(
        &self,
        actor: &AuthorId,
        group_id: &GroupId,
        member: &AuthorId,
        role: GroupRole,
    ) -> Result<GroupMembership> {
        let actor_role = self
            .store
            .get_membership(group_id, actor)
            .await?
            .map(|m| m.role);
        let allowed = match actor_role {
            Some(GroupRole::Maintainer) => true,
            Some(_) => false,
            None => {
                actor == member
                    && role == GroupRole::Maintainer
                    && self.store.list_members(group_id).await?.is_empty()
            }
        };
        if !allowed {
            let err = NotebookError::Denied {
                notebook: format!("group:{group_id}"),
                author: actor.to_string(),
                required: GroupRole::Maintainer.to_string(),
                effective: actor_role.map_or_else(|| "none".to_string(), |r| r.to_string()),
            };
            return Err(self.deny(actor, AuditAction::AddGroupMember, err));
        }

        let membership = GroupMembership {
            group_id: group_id.clone(),
            author_id: member.clone(),
            role,
        };
        self.store.put_membership(membership.clone()).await?;
        self.record(
            actor,
            AuditAction::AddGroupMember,
            None,
            Some(member.to_string()),
            json!({ "group_id": group_id, "role": role }),
        );
        Ok(membership)
    }

    // -----------------------------------------------------------------------
    // Entries
    // -----------------------------------------------------------------------

    /// Appends an entry. Content over the fragment limit is split; each
    /// fragment gets its own sequence number and jobs.
    #[instrument(skip(self, request), fields(bytes = request.content.len()))]
    pub async fn write_entry(
        &self,
        author: &AuthorId,
        notebook_id: NotebookId,
        request: WriteEntry,
    ) -> Result<WriteReceipt> {
        self.authorize(author, notebook_id, Tier::Write, AuditAction::WriteEntry)
            .await?;
        let receipt = self.append(author, notebook_id, request, None).await?;
        self.record(
            author,
            AuditAction::WriteEntry,
            Some(notebook_id),
            Some(receipt.head().id.to_string()),
            json!({ "sequence": receipt.sequence(), "fragments": receipt.entries.len() }),
        );
        Ok(receipt)
    }

    /// Writes a new entry that revises `entry_id`. The topic is inherited
    /// unless the request sets one.
    #[instrument(skip(self, request))]
    pub async fn revise_entry(
        &self,
        author: &AuthorId,
        entry_id: EntryId,
        mut request: WriteEntry,
    ) -> Result<WriteReceipt> {
        let original = self.entry(entry_id).await?;
        self.authorize(
            author,
            original.notebook_id,
            Tier::Write,
            AuditAction::ReviseEntry,
        )
        .await?;
        if request.topic.is_none() {
            request.topic = original.topic.clone();
        }
        let receipt = self
            .append(author, original.notebook_id, request, Some(entry_id))
            .await?;
        self.record(
            author,
            AuditAction::ReviseEntry,
            Some(original.notebook_id),
            Some(receipt.head().id.to_string()),
            json!({ "revision_of": entry_id, "sequence": receipt.sequence() }),
        );
        Ok(receipt)
    }

    async fn append(
        &self,
        author: &AuthorId,
        notebook_id: NotebookId,
        request: WriteEntry,
        revision_of: Option<EntryId>,
    ) -> Result<WriteReceipt> {
        if request.content.is_empty() {
            return Err(NotebookError::invalid("content", "must not be empty"));
        }
        let content_type = request
            .content_type
            .clone()
            .unwrap_or_else(|| "text/plain".to_string());
        let pieces = split_fragments(&request.content, self.max_fragment_bytes);
        let head_id = EntryId::new();

        let entries: Vec<NewEntry> = pieces
            .into_iter()
            .enumerate()
            .map(|(index, piece)| {
                let mut new = NewEntry::new(notebook_id, author.clone(), piece)
                    .with_content_type(content_type.clone())
                    .with_signature(request.signature.clone());
                new.topic = request.topic.clone();
                if index == 0 {
                    new.id = head_id;
                    new.revision_of = revision_of;
                    new.references = request.references.clone();
                } else {
                    new.fragment_of = Some(head_id);
                    new.fragment_index = Some(index as i32);
                }
                new
            })
            .collect();

        let written = self
            .pipeline
            .ledger()
            .append_with_jobs(&entries, self.sequence_retries)
            .await?;

        let mut receipt = WriteReceipt {
            entries: Vec::with_capacity(written.len()),
            jobs: Vec::with_capacity(written.len() * 2),
        };
        for (entry, jobs) in written {
            receipt.jobs.extend(jobs.iter().map(|j| j.id));
            self.events.publish(NotebookEvent::EntryWritten {
                notebook_id,
                entry_id: entry.id,
                sequence: entry.sequence,
            });
            receipt.entries.push(entry);
        }
        info!(
            %notebook_id,
            entry_id = %head_id,
            sequence = receipt.sequence(),
            fragments = receipt.entries.len(),
            "Wrote entry"
        );
        Ok(receipt)
    }

    pub async fn get_entry(&self, actor: &AuthorId, entry_id: EntryId) -> Result<Entry> {
        let entry = self.entry(entry_id).await?;
        self.access.require_read(entry.notebook_id, actor).await?;
        Ok(entry)
    }

    /// Entries after `after`, ascending by sequence.
    pub async fn list_entries(
        &self,
        actor: &AuthorId,
        notebook_id: NotebookId,
        after: i64,
        limit: usize,
    ) -> Result<Vec<Entry>> {
        self.access.require_read(notebook_id, actor).await?;
        Ok(self.store.entries_after(notebook_id, after, limit).await?)
    }

    /// Marks distilled claims verified.
    #[instrument(skip(self))]
    pub async fn verify_claims(&self, actor: &AuthorId, entry_id: EntryId) -> Result<Entry> {
        let entry = self.entry(entry_id).await?;
        self.authorize(actor, entry.notebook_id, Tier::Admin, AuditAction::VerifyClaims)
            .await?;
        let verified = self.pipeline.engine().mark_verified(entry_id).await?;
        self.record(
            actor,
            AuditAction::VerifyClaims,
            Some(entry.notebook_id),
            Some(entry_id.to_string()),
            json!({ "claims": verified.claims.len() }),
        );
        Ok(verified)
    }

    /// Jobs recorded for an entry, for inspection.
    pub async fn entry_jobs(&self, actor: &AuthorId, entry_id: EntryId) -> Result<Vec<Job>> {
        let entry = self.entry(entry_id).await?;
        self.access.require_read(entry.notebook_id, actor).await?;
        self.pipeline.ledger().jobs_for_entry(entry_id).await
    }

    pub async fn audit_log(
        &self,
        actor: &AuthorId,
        notebook_id: NotebookId,
        limit: usize,
    ) -> Result<Vec<AuditEvent>> {
        self.access.require_admin(notebook_id, actor).await?;
        Ok(self.store.list_audit(Some(notebook_id), limit).await?)
    }

    // -----------------------------------------------------------------------
    // Worker-facing
    // -----------------------------------------------------------------------

    pub async fn claim_job(&self, worker_id: &str, job_types: &[JobType]) -> Result<Option<Job>> {
        self.pipeline.ledger().claim_next(worker_id, job_types).await
    }

    pub async fn report_extraction(
        &self,
        worker_id: &str,
        job_id: JobId,
        claims: Vec<Claim>,
    ) -> Result<Entry> {
        self.pipeline
            .report_extraction(job_id, worker_id, claims)
            .await
    }

    pub async fn report_embedding(
        &self,
        worker_id: &str,
        job_id: JobId,
        embedding: Vec<f32>,
    ) -> Result<Entry> {
        self.pipeline
            .report_embedding(job_id, worker_id, embedding)
            .await
    }

    pub async fn fail_job(&self, worker_id: &str, job_id: JobId, error: &str) -> Result<FailOutcome> {
        self.pipeline.report_failure(job_id, worker_id, error).await
    }

    pub async fn reclaim_expired(&self) -> Result<ReclaimReport> {
        self.pipeline.reclaim_expired().await
    }

    pub async fn job_counts(&self) -> Result<Vec<(JobStatus, i64)>> {
        self.pipeline.ledger().job_counts().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_respects_char_boundaries() {
        let text = "aé€😀b";
        let pieces = split_fragments(text, 3);
        assert_eq!(pieces.concat(), text);
        assert!(pieces.iter().all(|p| !p.is_empty()));
        assert_eq!(pieces, vec!["aé", "€", "😀", "b"]);
    }

    #[test]
    fn test_split_small_content_is_single_piece() {
        assert_eq!(split_fragments("hello", 64), vec!["hello"]);
        assert_eq!(split_fragments("hello", 2), vec!["he", "ll", "o"]);
    }

    #[test]
    fn test_permission_presets_imply_lower_flags() {
        assert!(Permissions::ADMIN.write && Permissions::ADMIN.read);
        assert!(!Permissions::READ.write);
    }
}
