//! Integration engine.
//!
//! Collects results from extraction and embedding, scores an entry against
//! its neighbors once both exist, and drives the
//! Probation → Integrated/Contested lifecycle. Every derived-column write
//! goes through the entry's version token.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use config::IntegrationConfig;
use errors::{NotebookError, Result, StorageError};
use nb_core::{
    Claim, ClaimsStatus, Entry, EntryId, IntegrationCost, IntegrationStatus, IntegrationUpdate,
    Job, JobType, NotebookStore, StorageResult,
};
use observability::metrics;
use tracing::{debug, info, instrument, warn};

use crate::events::{EventBus, NotebookEvent};
use crate::friction::{self, METRIC_VERSION};
use crate::ledger::JobLedger;
use crate::retry::on_contention;

/// Scoring result for one entry against a fixed neighbor snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub update: IntegrationUpdate,
    /// Friction against each neighbor, in neighbor order.
    pub frictions: Vec<(EntryId, f64)>,
}

impl Assessment {
    pub fn conflicting(&self, threshold: f64) -> Vec<EntryId> {
        self.frictions
            .iter()
            .filter(|(_, f)| *f > threshold)
            .map(|(id, _)| *id)
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct ScoreOutcome {
    pub entry: Entry,
    /// Neighbors whose friction with the entry exceeded the threshold.
    pub conflicting: Vec<EntryId>,
    /// `false` when the stored score already matched or the entry was not
    /// ready.
    pub changed: bool,
}

fn normalized(v: &[f32]) -> Option<Vec<f64>> {
    let norm = v.iter().map(|x| f64::from(*x).powi(2)).sum::<f64>().sqrt();
    if norm == 0.0 {
        return None;
    }
    Some(v.iter().map(|x| f64::from(*x) / norm).collect())
}

/// Distance of the entry from the centroid of its neighbors, damped by
/// neighborhood size. An entry with no comparable neighbor shifts the
/// catalog fully.
fn catalog_shift(entry: &Entry, neighbors: &[Entry]) -> f64 {
    let Some(own) = entry.embedding.as_deref().and_then(normalized) else {
        return 1.0;
    };
    let others: Vec<Vec<f64>> = neighbors
        .iter()
        .filter_map(|n| n.embedding.as_deref().and_then(normalized))
        .filter(|v| v.len() == own.len())
        .collect();
    if others.is_empty() {
        return 1.0;
    }

    let n = others.len() as f64;
    let distance = own
        .iter()
        .enumerate()
        .map(|(i, x)| {
            let centroid = others.iter().map(|v| v[i]).sum::<f64>() / n;
            (x - centroid).powi(2)
        })
        .sum::<f64>()
        .sqrt();
    (distance / (n + 1.0)).min(1.0)
}

/// Pure scoring step. Deterministic for a fixed `neighbors` slice.
pub fn assess(
    entry: &Entry,
    neighbors: &[Entry],
    references_broken: u32,
    threshold: f64,
) -> Assessment {
    let frictions: Vec<(EntryId, f64)> = neighbors
        .iter()
        .map(|n| (n.id, friction::friction(entry, n)))
        .collect();

    let max_friction = frictions.iter().map(|(_, f)| *f).fold(0.0, f64::max);
    let entries_revised = frictions.iter().filter(|(_, f)| *f > threshold).count() as u32;
    let orphan = !frictions.iter().any(|(_, f)| *f <= threshold);

    let cost = IntegrationCost {
        entries_revised,
        references_broken,
        catalog_shift: catalog_shift(entry, neighbors),
        orphan,
    };
    let status = if max_friction <= threshold {
        IntegrationStatus::Integrated
    } else {
        IntegrationStatus::Contested
    };

    Assessment {
        update: IntegrationUpdate {
            max_friction,
            needs_review: cost.orphan || cost.references_broken > 0,
            cost,
            status,
            metric_version: METRIC_VERSION.to_string(),
        },
        frictions,
    }
}

fn is_current(entry: &Entry, update: &IntegrationUpdate) -> bool {
    entry.metric_version.as_deref() == Some(update.metric_version.as_str())
        && entry.max_friction == Some(update.max_friction)
        && entry.integration_cost.as_ref() == Some(&update.cost)
        && entry.integration_status == update.status
        && entry.needs_review == update.needs_review
}

#[derive(Clone)]
pub struct IntegrationEngine {
    store: Arc<dyn NotebookStore>,
    ledger: JobLedger,
    events: EventBus,
    config: IntegrationConfig,
}

impl IntegrationEngine {
    pub fn new(
        store: Arc<dyn NotebookStore>,
        ledger: JobLedger,
        events: EventBus,
        config: IntegrationConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            events,
            config,
        }
    }

    pub fn config(&self) -> &IntegrationConfig {
        &self.config
    }

    async fn load(&self, entry_id: EntryId) -> StorageResult<Entry> {
        self.store
            .get_entry(entry_id)
            .await?
            .ok_or_else(|| StorageError::not_found("entries", entry_id))
    }

    /// Stores extracted claims and scores the entry if its embedding is
    /// already in. Ignored for entries whose claims already failed or were
    /// verified.
    #[instrument(skip(self, claims), fields(claim_count = claims.len()))]
    pub async fn on_extraction_complete(
        &self,
        entry_id: EntryId,
        claims: Vec<Claim>,
    ) -> Result<Entry> {
        let claims = &claims;
        let (entry, applied) =
            on_contention("record_claims", self.config.update_retries, || async move {
                let entry = self.load(entry_id).await?;
                if !entry
                    .claims_status
                    .can_transition_to(ClaimsStatus::Distilled)
                {
                    return Ok((entry, false));
                }
                let updated = self
                    .store
                    .update_claims(entry_id, claims.clone(), ClaimsStatus::Distilled, entry.version)
                    .await?;
                Ok((updated, true))
            })
            .await?;

        if !applied {
            debug!(%entry_id, status = %entry.claims_status, "Ignoring extraction result");
            return Ok(entry);
        }
        self.events.publish(NotebookEvent::ClaimsUpdated {
            notebook_id: entry.notebook_id,
            entry_id,
            status: entry.claims_status,
        });
        self.score_if_ready(entry).await
    }

    /// Stores the embedding and scores the entry if its claims are already
    /// distilled.
    #[instrument(skip(self, embedding), fields(dimensions = embedding.len()))]
    pub async fn on_embedding_complete(
        &self,
        entry_id: EntryId,
        embedding: Vec<f32>,
    ) -> Result<Entry> {
        if embedding.is_empty() {
            return Err(NotebookError::invalid("embedding", "empty vector"));
        }
        let embedding = &embedding;
        let (entry, applied) =
            on_contention("record_embedding", self.config.update_retries, || async move {
                let entry = self.load(entry_id).await?;
                if entry.claims_status.is_terminal() {
                    return Ok((entry, false));
                }
                let updated = self
                    .store
                    .update_embedding(entry_id, embedding.clone(), entry.version)
                    .await?;
                Ok((updated, true))
            })
            .await?;

        if !applied {
            debug!(%entry_id, "Ignoring embedding for failed entry");
            return Ok(entry);
        }
        self.score_if_ready(entry).await
    }

    /// Handles a job that spent its retry budget. A failed extraction or
    /// embedding marks the entry's claims `Failed`, which stops scoring and
    /// mirroring for that entry only.
    #[instrument(skip(self, job), fields(job_id = %job.id, entry_id = %job.entry_id, job_type = %job.job_type))]
    pub async fn on_stage_failed(&self, job: &Job) -> Result<Option<Entry>> {
        let error = job.error.clone().unwrap_or_default();
        self.events.publish(NotebookEvent::JobExhausted {
            job_id: job.id,
            entry_id: job.entry_id,
            job_type: job.job_type,
        });
        self.events.publish(NotebookEvent::StageFailed {
            notebook_id: job.notebook_id,
            entry_id: job.entry_id,
            job_type: job.job_type,
            error: error.clone(),
        });

        if job.job_type == JobType::ScoreIntegration {
            warn!(error, "Scoring failed permanently, entry keeps its last score");
            return Ok(None);
        }

        let entry_id = job.entry_id;
        let (entry, applied) =
            on_contention("fail_claims", self.config.update_retries, || async move {
                let entry = self.load(entry_id).await?;
                if !entry.claims_status.can_transition_to(ClaimsStatus::Failed) {
                    return Ok((entry, false));
                }
                let claims = entry.claims.clone();
                let updated = self
                    .store
                    .update_claims(entry_id, claims, ClaimsStatus::Failed, entry.version)
                    .await?;
                Ok((updated, true))
            })
            .await?;

        if applied {
            warn!(error, "Marked claims failed");
            self.events.publish(NotebookEvent::ClaimsUpdated {
                notebook_id: entry.notebook_id,
                entry_id,
                status: ClaimsStatus::Failed,
            });
        }
        Ok(Some(entry))
    }

    /// Moves distilled claims to `Verified`.
    pub async fn mark_verified(&self, entry_id: EntryId) -> Result<Entry> {
        let (entry, applied) =
            on_contention("verify_claims", self.config.update_retries, || async move {
                let entry = self.load(entry_id).await?;
                if entry.claims_status != ClaimsStatus::Distilled {
                    return Ok((entry, false));
                }
                let claims = entry.claims.clone();
                let updated = self
                    .store
                    .update_claims(entry_id, claims, ClaimsStatus::Verified, entry.version)
                    .await?;
                Ok((updated, true))
            })
            .await?;

        if !applied {
            return Err(NotebookError::invalid(
                "claims_status",
                format!("cannot verify {} claims", entry.claims_status),
            ));
        }
        self.events.publish(NotebookEvent::ClaimsUpdated {
            notebook_id: entry.notebook_id,
            entry_id,
            status: ClaimsStatus::Verified,
        });
        Ok(entry)
    }

    async fn score_if_ready(&self, entry: Entry) -> Result<Entry> {
        if !entry.is_ready_for_integration() {
            return Ok(entry);
        }
        Ok(self.score(entry.id, true).await?.entry)
    }

    /// Scores `entry_id` against its current neighbors. With `cascade`, a
    /// changed score schedules non-cascading rescores of every conflicting
    /// neighbor.
    #[instrument(skip(self))]
    pub async fn score(&self, entry_id: EntryId, cascade: bool) -> Result<ScoreOutcome> {
        let outcome = on_contention("score_integration", self.config.update_retries, || async move {
            self.try_score(entry_id).await
        })
        .await?;

        if !outcome.changed {
            return Ok(outcome);
        }

        let entry = &outcome.entry;
        let max_friction = entry.max_friction.unwrap_or_default();
        metrics::record_integration_scored(&entry.integration_status.to_string(), max_friction);
        info!(
            %entry_id,
            status = %entry.integration_status,
            max_friction,
            needs_review = entry.needs_review,
            "Scored entry"
        );
        self.events.publish(NotebookEvent::IntegrationScored {
            notebook_id: entry.notebook_id,
            entry_id,
            status: entry.integration_status,
            max_friction,
        });

        if cascade && self.config.cascade_rescore && !outcome.conflicting.is_empty() {
            for neighbor in self.store.get_entries(&outcome.conflicting).await? {
                self.ledger.enqueue_rescore(&neighbor, false).await?;
            }
        }
        Ok(outcome)
    }

    async fn try_score(&self, entry_id: EntryId) -> StorageResult<ScoreOutcome> {
        let entry = self.load(entry_id).await?;
        if !entry.is_ready_for_integration() {
            return Ok(ScoreOutcome {
                entry,
                conflicting: Vec::new(),
                changed: false,
            });
        }

        let (neighbors, references_broken) = self.neighbors(&entry).await?;
        let assessment = assess(
            &entry,
            &neighbors,
            references_broken,
            self.config.friction_threshold,
        );
        let conflicting = assessment.conflicting(self.config.friction_threshold);

        if is_current(&entry, &assessment.update) {
            debug!(%entry_id, "Score unchanged");
            return Ok(ScoreOutcome {
                entry,
                conflicting,
                changed: false,
            });
        }

        let updated = self
            .store
            .update_integration(entry_id, assessment.update, entry.version)
            .await?;
        Ok(ScoreOutcome {
            entry: updated,
            conflicting,
            changed: true,
        })
    }

    /// Related entries in the same notebook that are themselves scorable,
    /// ordered by sequence, plus the number of direct references that do not
    /// resolve. Relations: shared topic, references followed breadth-first
    /// up to the configured depth, inbound references, and embedding
    /// similarity at or above the configured threshold.
    pub async fn neighbors(&self, entry: &Entry) -> StorageResult<(Vec<Entry>, u32)> {
        let notebook_id = entry.notebook_id;
        let mut found: HashMap<EntryId, Entry> = HashMap::new();

        let mut visited: HashSet<EntryId> = HashSet::from([entry.id]);
        let mut frontier: Vec<EntryId> = entry
            .outbound_links()
            .into_iter()
            .filter(|id| visited.insert(*id))
            .collect();
        let direct = self.store.get_entries(&frontier).await?;
        let resolved = direct
            .iter()
            .filter(|e| e.notebook_id == notebook_id)
            .count();
        let references_broken = (frontier.len() - resolved) as u32;

        let mut hop = direct;
        for depth in 1..=self.config.max_reference_depth {
            if depth > 1 {
                frontier.retain(|id| visited.insert(*id));
                if frontier.is_empty() {
                    break;
                }
                hop = self.store.get_entries(&frontier).await?;
            }
            frontier = Vec::new();
            for linked in hop.drain(..) {
                if linked.notebook_id != notebook_id {
                    continue;
                }
                frontier.extend(linked.outbound_links());
                found.insert(linked.id, linked);
            }
        }

        if let Some(topic) = &entry.topic {
            for e in self.store.entries_by_topic(notebook_id, topic).await? {
                found.insert(e.id, e);
            }
        }
        for e in self.store.entries_referencing(notebook_id, entry.id).await? {
            found.insert(e.id, e);
        }
        if let Some(own) = &entry.embedding {
            for e in self.store.embedded_entries(notebook_id).await? {
                let similar = e
                    .embedding
                    .as_deref()
                    .is_some_and(|v| friction::cosine(own, v) >= self.config.similarity_threshold);
                if similar {
                    found.insert(e.id, e);
                }
            }
        }

        let mut neighbors: Vec<Entry> = found
            .into_values()
            .filter(|e| e.id != entry.id && e.is_ready_for_integration())
            .collect();
        neighbors.sort_by_key(|e| std::cmp::Reverse(e.sequence));
        neighbors.truncate(self.config.max_neighbors);
        neighbors.sort_by_key(|e| e.sequence);
        Ok((neighbors, references_broken))
    }
}
