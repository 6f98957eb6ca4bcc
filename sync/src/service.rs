//! Access-checked mirroring operations.

use std::sync::Arc;

use config::MirrorConfig;
use errors::{NotebookError, Result};
use knowledge::{AccessControl, EventBus};
use nb_core::{
    AuditAction, AuditEvent, AuditOutcome, AuthorId, Clock, EntryId, MirroredClaim, NotebookId,
    NotebookStore, Subscription, SubscriptionFilter, SubscriptionId, SystemClock, Tier,
};
use observability::AuditSink;
use serde_json::json;
use tracing::{info, instrument};

use crate::replicator::{MirrorReplicator, PumpReport};

pub struct MirrorService {
    store: Arc<dyn NotebookStore>,
    access: AccessControl,
    replicator: MirrorReplicator,
    audit: AuditSink,
    clock: Arc<dyn Clock>,
}

impl MirrorService {
    pub fn new(
        store: Arc<dyn NotebookStore>,
        config: &MirrorConfig,
        audit: AuditSink,
        events: EventBus,
    ) -> Self {
        Self {
            access: AccessControl::new(store.clone()),
            replicator: MirrorReplicator::new(store.clone(), events, config.batch_size),
            store,
            audit,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.access = self.access.with_clock(clock.clone());
        self.replicator = self.replicator.with_clock(clock.clone());
        self.clock = clock;
        self
    }

    pub fn replicator(&self) -> &MirrorReplicator {
        &self.replicator
    }

    fn allowed(&self, actor: &AuthorId, action: AuditAction, notebook_id: NotebookId) -> AuditEvent {
        AuditEvent::new(actor.clone(), action, AuditOutcome::Allowed, self.clock.now())
            .on_notebook(notebook_id)
    }

    /// Subscribes `target` to distilled claims of `source`. Requires Admin
    /// on the source, Write on the target, and target labels that dominate
    /// the source's.
    #[instrument(skip(self, filter))]
    pub async fn subscribe(
        &self,
        actor: &AuthorId,
        source: NotebookId,
        target: NotebookId,
        filter: SubscriptionFilter,
    ) -> Result<Subscription> {
        if source == target {
            return Err(NotebookError::invalid(
                "target",
                "a notebook cannot subscribe to itself",
            ));
        }
        if filter
            .min_confidence
            .is_some_and(|c| !(0.0..=1.0).contains(&c))
        {
            return Err(NotebookError::invalid(
                "min_confidence",
                "must be within 0..=1",
            ));
        }
        self.access
            .authorize(&self.audit, AuditAction::Subscribe, source, actor, Tier::Admin)
            .await?;
        self.access
            .authorize(&self.audit, AuditAction::Subscribe, target, actor, Tier::Write)
            .await?;
        if let Err(e) = self
            .replicator
            .check_label_flow(source, target, actor)
            .await
        {
            if e.is_denied() {
                self.audit.record(
                    AuditEvent::new(
                        actor.clone(),
                        AuditAction::Subscribe,
                        AuditOutcome::Denied,
                        self.clock.now(),
                    )
                    .on_notebook(source)
                    .with_details(json!({ "target_notebook_id": target, "reason": e.to_string() })),
                );
            }
            return Err(e);
        }

        let subscription = self
            .store
            .create_subscription(Subscription {
                id: SubscriptionId::new(),
                source_notebook_id: source,
                target_notebook_id: target,
                filter,
                watermark: 0,
                created_by: actor.clone(),
                created_at: self.clock.now(),
            })
            .await?;
        info!(subscription_id = %subscription.id, "Created subscription");
        self.audit.record(
            self.allowed(actor, AuditAction::Subscribe, source)
                .with_target(subscription.id)
                .with_details(json!({ "target_notebook_id": target })),
        );
        Ok(subscription)
    }

    /// Mirrors landing in `target`, ordered by subscription then source
    /// sequence. Requires Read on the target.
    pub async fn list_mirrors(
        &self,
        actor: &AuthorId,
        target: NotebookId,
        include_tombstoned: bool,
    ) -> Result<Vec<MirroredClaim>> {
        self.access
            .authorize(&self.audit, AuditAction::ReadMirrors, target, actor, Tier::Read)
            .await?;
        let mirrors = self.store.list_mirrors(target, include_tombstoned).await?;
        self.audit.record(
            self.allowed(actor, AuditAction::ReadMirrors, target)
                .with_details(json!({ "count": mirrors.len() })),
        );
        Ok(mirrors)
    }

    /// Retracts a source entry. Its author may retract with Write; anyone
    /// else needs Admin on the source notebook.
    #[instrument(skip(self))]
    pub async fn retract(&self, actor: &AuthorId, entry_id: EntryId) -> Result<u64> {
        let entry = self
            .store
            .get_entry(entry_id)
            .await?
            .ok_or_else(|| NotebookError::not_found("entry", entry_id))?;
        let required = if &entry.author_id == actor {
            Tier::Write
        } else {
            Tier::Admin
        };
        self.access
            .authorize(
                &self.audit,
                AuditAction::RetractEntry,
                entry.notebook_id,
                actor,
                required,
            )
            .await?;

        let tombstoned = self.replicator.retract(entry_id).await?;
        self.audit.record(
            self.allowed(actor, AuditAction::RetractEntry, entry.notebook_id)
                .with_target(entry_id)
                .with_details(json!({ "tombstoned": tombstoned })),
        );
        Ok(tombstoned)
    }

    /// Pumps one subscription. A pass that is blocked without advancing
    /// fails with [`NotebookError::ReplicationGap`]; callers retry later.
    pub async fn pump(&self, subscription_id: SubscriptionId) -> Result<usize> {
        let report: PumpReport = self.replicator.pump(subscription_id).await?;
        match report.blocked_at {
            Some(blocked_at) if !report.advanced() => Err(NotebookError::ReplicationGap {
                subscription_id: subscription_id.to_string(),
                watermark: report.watermark,
                blocked_at,
            }),
            _ => Ok(report.mirrored),
        }
    }
}
