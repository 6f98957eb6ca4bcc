//! Effective permission tiers.
//!
//! Resolution order is owner, then explicit grant, then group role when the
//! notebook is group-owned. A labelled notebook caps every author without a
//! covering clearance at [`Tier::None`], the owner included.

use std::sync::Arc;

use errors::NotebookError;
use nb_core::{
    AuditAction, AuditEvent, AuditOutcome, AuthorId, Clock, Notebook, NotebookId, NotebookStore,
    StorageResult, SystemClock, Tier,
};
use observability::AuditSink;
use serde_json::json;
use tracing::debug;

#[derive(Clone)]
pub struct AccessControl {
    store: Arc<dyn NotebookStore>,
    clock: Arc<dyn Clock>,
}

impl AccessControl {
    pub fn new(store: Arc<dyn NotebookStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub async fn effective_tier(
        &self,
        notebook: &Notebook,
        author: &AuthorId,
    ) -> StorageResult<Tier> {
        if notebook.is_labelled() {
            let cleared = self
                .store
                .get_clearance(author)
                .await?
                .is_some_and(|c| c.covers(notebook));
            if !cleared {
                debug!(notebook_id = %notebook.id, %author, "Author lacks clearance");
                return Ok(Tier::None);
            }
        }

        if &notebook.owner_id == author {
            return Ok(Tier::Owner);
        }

        if let Some(grant) = self.store.get_grant(notebook.id, author).await? {
            let tier = grant.tier();
            if tier > Tier::None {
                return Ok(tier);
            }
        }

        if let Some(group_id) = &notebook.group_id {
            if let Some(membership) = self.store.get_membership(group_id, author).await? {
                return Ok(membership.role.tier());
            }
        }

        Ok(Tier::None)
    }

    pub async fn tier_for(
        &self,
        notebook_id: NotebookId,
        author: &AuthorId,
    ) -> Result<(Notebook, Tier), NotebookError> {
        let notebook = self
            .store
            .get_notebook(notebook_id)
            .await?
            .ok_or_else(|| NotebookError::not_found("notebook", notebook_id))?;
        let tier = self.effective_tier(&notebook, author).await?;
        Ok((notebook, tier))
    }

    /// Loads the notebook and checks `author` holds at least `required`.
    pub async fn require(
        &self,
        notebook_id: NotebookId,
        author: &AuthorId,
        required: Tier,
    ) -> Result<Notebook, NotebookError> {
        let (notebook, effective) = self.tier_for(notebook_id, author).await?;
        if !effective.satisfies(required) {
            return Err(NotebookError::Denied {
                notebook: notebook_id.to_string(),
                author: author.to_string(),
                required: required.to_string(),
                effective: effective.to_string(),
            });
        }
        Ok(notebook)
    }

    /// [`require`](Self::require), recording a denial in the audit log.
    pub async fn authorize(
        &self,
        audit: &AuditSink,
        action: AuditAction,
        notebook_id: NotebookId,
        actor: &AuthorId,
        required: Tier,
    ) -> Result<Notebook, NotebookError> {
        let result = self.require(notebook_id, actor, required).await;
        if let Err(e) = &result {
            if e.is_denied() {
                audit.record(
                    AuditEvent::new(
                        actor.clone(),
                        action,
                        AuditOutcome::Denied,
                        self.clock.now(),
                    )
                    .on_notebook(notebook_id)
                    .with_details(json!({ "required": required })),
                );
            }
        }
        result
    }

    pub async fn require_read(
        &self,
        notebook_id: NotebookId,
        author: &AuthorId,
    ) -> Result<Notebook, NotebookError> {
        self.require(notebook_id, author, Tier::Read).await
    }

    pub async fn require_write(
        &self,
        notebook_id: NotebookId,
        author: &AuthorId,
    ) -> Result<Notebook, NotebookError> {
        self.require(notebook_id, author, Tier::Write).await
    }

    pub async fn require_admin(
        &self,
        notebook_id: NotebookId,
        author: &AuthorId,
    ) -> Result<Notebook, NotebookError> {
        self.require(notebook_id, author, Tier::Admin).await
    }

    pub async fn require_owner(
        &self,
        notebook_id: NotebookId,
        author: &AuthorId,
    ) -> Result<Notebook, NotebookError> {
        self.require(notebook_id, author, Tier::Owner).await
    }
}
