//! Claim replication between notebooks.
//!
//! A pump walks source entries past the subscription watermark in strict
//! sequence order. It stops at the first hole (a sequence not yet visible) or
//! at the first entry whose claims are still pending, so a target never sees
//! a mirror ahead of an unresolved lower sequence. Entries whose claims
//! failed, or that the filter excludes, advance the watermark without a
//! mirror. Only claims, topic and optionally the embedding cross over.
//! Claims only flow into a target whose labels dominate the source's.

use std::sync::Arc;

use errors::{NotebookError, Result};
use knowledge::{EventBus, NotebookEvent};
use nb_core::{
    AuthorId, ClaimsStatus, Clock, Entry, EntryId, MirroredClaim, NotebookId, NotebookStore,
    Subscription, SubscriptionId, SystemClock,
};
use observability::metrics;
use tracing::{debug, info, instrument, warn};

/// Result of one pump pass over a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpReport {
    pub mirrored: usize,
    pub start_watermark: i64,
    pub watermark: i64,
    /// First source sequence the pass could not get past.
    pub blocked_at: Option<i64>,
}

impl PumpReport {
    fn idle(watermark: i64) -> Self {
        Self {
            mirrored: 0,
            start_watermark: watermark,
            watermark,
            blocked_at: None,
        }
    }

    pub fn advanced(&self) -> bool {
        self.watermark > self.start_watermark
    }
}

/// Where a walk over a batch ended up.
struct Walk {
    mirrors: Vec<MirroredClaim>,
    watermark: i64,
    blocked_at: Option<i64>,
}

#[derive(Clone)]
pub struct MirrorReplicator {
    store: Arc<dyn NotebookStore>,
    events: EventBus,
    clock: Arc<dyn Clock>,
    batch_size: usize,
}

impl MirrorReplicator {
    pub fn new(store: Arc<dyn NotebookStore>, events: EventBus, batch_size: usize) -> Self {
        Self {
            store,
            events,
            clock: Arc::new(SystemClock),
            batch_size: batch_size.max(1),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Fails with `Denied` unless `target` carries at least the
    /// classification and compartments of `source`.
    pub async fn check_label_flow(
        &self,
        source: NotebookId,
        target: NotebookId,
        actor: &AuthorId,
    ) -> Result<()> {
        let source_nb = self
            .store
            .get_notebook(source)
            .await?
            .ok_or_else(|| NotebookError::not_found("notebook", source))?;
        let target_nb = self
            .store
            .get_notebook(target)
            .await?
            .ok_or_else(|| NotebookError::not_found("notebook", target))?;
        if target_nb.dominates(&source_nb) {
            return Ok(());
        }
        warn!(%source, %target, "Target labels do not dominate source labels");
        Err(NotebookError::Denied {
            notebook: target.to_string(),
            author: actor.to_string(),
            required: source_nb.label(),
            effective: target_nb.label(),
        })
    }

    fn project(&self, subscription: &Subscription, entry: &Entry) -> Option<MirroredClaim> {
        let filter = &subscription.filter;
        if !filter.matches_topic(entry.topic.as_deref()) {
            return None;
        }
        let claims = filter.select_claims(&entry.claims);
        if claims.is_empty() {
            return None;
        }
        Some(MirroredClaim {
            subscription_id: subscription.id,
            source_entry_id: entry.id,
            source_notebook_id: entry.notebook_id,
            claims,
            topic: entry.topic.clone(),
            embedding: if filter.include_embedding {
                entry.embedding.clone()
            } else {
                None
            },
            source_sequence: entry.sequence,
            tombstoned: false,
            mirrored_at: self.clock.now(),
        })
    }

    fn walk(&self, subscription: &Subscription, batch: &[Entry]) -> Walk {
        let mut walk = Walk {
            mirrors: Vec::new(),
            watermark: subscription.watermark,
            blocked_at: None,
        };
        for entry in batch {
            let expected = walk.watermark + 1;
            if entry.sequence != expected {
                walk.blocked_at = Some(expected);
                break;
            }
            match entry.claims_status {
                ClaimsStatus::Pending => {
                    walk.blocked_at = Some(entry.sequence);
                    break;
                }
                ClaimsStatus::Failed => {
                    debug!(entry_id = %entry.id, sequence = entry.sequence, "Skipping failed entry");
                }
                ClaimsStatus::Distilled | ClaimsStatus::Verified => {
                    walk.mirrors.extend(self.project(subscription, entry));
                }
            }
            walk.watermark = entry.sequence;
        }
        walk
    }

    /// Mirrors as far as the source allows. Safe to run concurrently for the
    /// same subscription: only one pass moves a given watermark, the other
    /// reports nothing mirrored.
    #[instrument(skip(self), fields(watermark = tracing::field::Empty))]
    pub async fn pump(&self, subscription_id: SubscriptionId) -> Result<PumpReport> {
        let mut subscription = self
            .store
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| NotebookError::not_found("subscription", subscription_id))?;
        tracing::Span::current().record("watermark", subscription.watermark);
        self.check_label_flow(
            subscription.source_notebook_id,
            subscription.target_notebook_id,
            &subscription.created_by,
        )
        .await?;

        let mut report = PumpReport::idle(subscription.watermark);
        loop {
            let batch = self
                .store
                .entries_after(
                    subscription.source_notebook_id,
                    subscription.watermark,
                    self.batch_size,
                )
                .await?;
            if batch.is_empty() {
                break;
            }

            let walk = self.walk(&subscription, &batch);
            if walk.watermark > subscription.watermark {
                let count = walk.mirrors.len();
                let applied = self
                    .store
                    .apply_mirrors(
                        subscription.id,
                        walk.mirrors,
                        subscription.watermark,
                        walk.watermark,
                    )
                    .await?;
                if !applied {
                    debug!(%subscription_id, "Watermark moved by a concurrent pump");
                    return Ok(report);
                }
                subscription.watermark = walk.watermark;
                report.mirrored += count;
                report.watermark = walk.watermark;
            }

            if let Some(blocked_at) = walk.blocked_at {
                report.blocked_at = Some(blocked_at);
                metrics::record_mirror_gap();
                debug!(%subscription_id, watermark = report.watermark, blocked_at, "Pump blocked");
                break;
            }
            if batch.len() < self.batch_size {
                break;
            }
        }

        if report.mirrored > 0 {
            metrics::record_mirrors_applied(report.mirrored);
            self.events.publish(NotebookEvent::MirrorsApplied {
                subscription_id,
                count: report.mirrored,
                watermark: report.watermark,
            });
            info!(
                %subscription_id,
                mirrored = report.mirrored,
                watermark = report.watermark,
                "Applied mirrors"
            );
        }
        Ok(report)
    }

    /// Pumps every subscription. A failing subscription is logged and does
    /// not stop the others.
    pub async fn pump_all(&self) -> Result<Vec<(SubscriptionId, PumpReport)>> {
        let subscriptions = self.store.list_subscriptions().await?;
        let mut reports = Vec::with_capacity(subscriptions.len());
        for subscription in subscriptions {
            match self.pump(subscription.id).await {
                Ok(report) => reports.push((subscription.id, report)),
                Err(e) => {
                    warn!(subscription_id = %subscription.id, error = %e, "Pump failed");
                }
            }
        }
        Ok(reports)
    }

    /// Tombstones every mirror of `entry_id`. Later pumps never revive them.
    #[instrument(skip(self))]
    pub async fn retract(&self, entry_id: EntryId) -> Result<u64> {
        let tombstoned = self.store.tombstone_source_entry(entry_id).await?;
        info!(tombstoned, "Retracted entry");
        self.events.publish(NotebookEvent::EntryRetracted {
            entry_id,
            tombstoned,
        });
        Ok(tombstoned)
    }
}
