use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strum::{Display, EnumString};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Identity of a notebook.
    NotebookId
);
uuid_id!(
    /// Identity of an entry. Stable across mirrors.
    EntryId
);
uuid_id!(JobId);
uuid_id!(SubscriptionId);

/// Identity of a writer, human or agent, as asserted by the external token
/// validator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthorId(String);

impl AuthorId {
    pub fn new(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        if id.is_empty() || id.len() > 100 {
            None
        } else {
            Some(Self(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for AuthorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for AuthorId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s).ok_or_else(|| format!("Invalid author id: {s:?}"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(String);

impl GroupId {
    pub fn new(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        if id.is_empty() || id.len() > 100 {
            None
        } else {
            Some(Self(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Notebooks and access
// ---------------------------------------------------------------------------

/// Classification labels, ordered from least to most sensitive.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Classification {
    Unclassified,
    Internal,
    Confidential,
    Secret,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notebook {
    pub id: NotebookId,
    pub name: String,
    pub owner_id: AuthorId,
    pub group_id: Option<GroupId>,
    pub classification: Option<Classification>,
    pub compartments: BTreeSet<String>,
    pub current_sequence: i64,
    pub created_at: DateTime<Utc>,
}

impl Notebook {
    pub fn new(name: impl Into<String>, owner_id: AuthorId, created_at: DateTime<Utc>) -> Self {
        Self {
            id: NotebookId::new(),
            name: name.into(),
            owner_id,
            group_id: None,
            classification: None,
            compartments: BTreeSet::new(),
            current_sequence: 0,
            created_at,
        }
    }

    pub fn with_group(mut self, group_id: GroupId) -> Self {
        self.group_id = Some(group_id);
        self
    }

    pub fn with_classification(mut self, level: Classification) -> Self {
        self.classification = Some(level);
        self
    }

    pub fn with_compartment(mut self, compartment: impl Into<String>) -> Self {
        self.compartments.insert(compartment.into());
        self
    }

    pub fn is_labelled(&self) -> bool {
        self.classification.is_some() || !self.compartments.is_empty()
    }

    /// True when these labels are at least as restrictive as `other`'s:
    /// level no lower and compartments a superset.
    pub fn dominates(&self, other: &Notebook) -> bool {
        let level_ok = match (self.classification, other.classification) {
            (_, None) => true,
            (Some(mine), Some(theirs)) => mine >= theirs,
            (None, Some(_)) => false,
        };
        level_ok && other.compartments.is_subset(&self.compartments)
    }

    pub fn label(&self) -> String {
        let level = self
            .classification
            .map_or_else(|| "unlabelled".to_string(), |c| c.to_string());
        if self.compartments.is_empty() {
            level
        } else {
            let compartments: Vec<&str> = self.compartments.iter().map(String::as_str).collect();
            format!("{level}[{}]", compartments.join(","))
        }
    }
}

/// Effective permission tier. Variant order is privilege order.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Tier {
    None,
    Read,
    Write,
    Admin,
    Owner,
}

impl Tier {
    pub fn satisfies(self, required: Tier) -> bool {
        self >= required
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessGrant {
    pub notebook_id: NotebookId,
    pub author_id: AuthorId,
    pub read: bool,
    pub write: bool,
    pub admin: bool,
    pub granted_by: AuthorId,
    pub granted_at: DateTime<Utc>,
}

impl AccessGrant {
    /// Highest tier the grant confers on its own. Write implies Read, Admin
    /// implies Write.
    pub fn tier(&self) -> Tier {
        if self.admin {
            Tier::Admin
        } else if self.write {
            Tier::Write
        } else if self.read {
            Tier::Read
        } else {
            Tier::None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clearance {
    pub author_id: AuthorId,
    pub level: Classification,
    pub compartments: BTreeSet<String>,
}

impl Clearance {
    pub fn covers(&self, notebook: &Notebook) -> bool {
        let level_ok = notebook
            .classification
            .is_none_or(|required| self.level >= required);
        level_ok && notebook.compartments.is_subset(&self.compartments)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum GroupRole {
    Member,
    Contributor,
    Maintainer,
}

impl GroupRole {
    pub fn tier(self) -> Tier {
        match self {
            GroupRole::Member => Tier::Read,
            GroupRole::Contributor => Tier::Write,
            GroupRole::Maintainer => Tier::Admin,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMembership {
    pub group_id: GroupId,
    pub author_id: AuthorId,
    pub role: GroupRole,
}

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub text: String,
    pub confidence: f64,
}

impl Claim {
    pub fn new(text: impl Into<String>, confidence: f64) -> Self {
        Self {
            text: text.into(),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ClaimsStatus {
    #[default]
    Pending,
    Distilled,
    Verified,
    Failed,
}

impl ClaimsStatus {
    pub fn is_distilled(self) -> bool {
        matches!(self, ClaimsStatus::Distilled | ClaimsStatus::Verified)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ClaimsStatus::Failed)
    }

    /// Claims only move forward. A distilled entry may be re-reported with
    /// fresh claims; nothing leaves `Failed`.
    pub fn can_transition_to(self, next: ClaimsStatus) -> bool {
        use ClaimsStatus::*;

        matches!(
            (self, next),
            (Pending, Distilled)
                | (Distilled, Distilled)
                | (Distilled, Verified)
                | (Pending, Failed)
                | (Distilled, Failed)
                | (Verified, Failed)
        )
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum IntegrationStatus {
    #[default]
    Probation,
    Integrated,
    Contested,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntegrationCost {
    pub entries_revised: u32,
    pub references_broken: u32,
    pub catalog_shift: f64,
    pub orphan: bool,
}

/// Columns written by one scoring pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationUpdate {
    pub max_friction: f64,
    pub cost: IntegrationCost,
    pub status: IntegrationStatus,
    pub needs_review: bool,
    pub metric_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub id: EntryId,
    pub notebook_id: NotebookId,
    pub content: String,
    pub content_type: String,
    pub content_hash: String,
    pub author_id: AuthorId,
    pub signature: String,
    pub sequence: i64,
    pub created_at: DateTime<Utc>,
    pub topic: Option<String>,
    pub revision_of: Option<EntryId>,
    pub fragment_of: Option<EntryId>,
    pub fragment_index: Option<i32>,
    pub references: Vec<EntryId>,
    pub claims: Vec<Claim>,
    pub claims_status: ClaimsStatus,
    pub embedding: Option<Vec<f32>>,
    pub max_friction: Option<f64>,
    pub integration_cost: Option<IntegrationCost>,
    pub integration_status: IntegrationStatus,
    pub needs_review: bool,
    pub metric_version: Option<String>,
    /// Optimistic concurrency token, bumped by every derived-column write.
    pub version: i64,
}

impl Entry {
    pub fn has_embedding(&self) -> bool {
        self.embedding.as_ref().is_some_and(|e| !e.is_empty())
    }

    /// Scoring needs distilled claims and an embedding.
    pub fn is_ready_for_integration(&self) -> bool {
        self.claims_status.is_distilled() && self.has_embedding()
    }

    /// Ids this entry points at: explicit references plus the revised entry.
    pub fn outbound_links(&self) -> Vec<EntryId> {
        let mut links = self.references.clone();
        if let Some(revised) = self.revision_of {
            if !links.contains(&revised) {
                links.push(revised);
            }
        }
        links
    }
}

pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

/// An entry as submitted, before the sequencer stamps it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEntry {
    pub id: EntryId,
    pub notebook_id: NotebookId,
    pub content: String,
    pub content_type: String,
    pub author_id: AuthorId,
    pub signature: String,
    pub topic: Option<String>,
    pub revision_of: Option<EntryId>,
    pub fragment_of: Option<EntryId>,
    pub fragment_index: Option<i32>,
    pub references: Vec<EntryId>,
}

impl NewEntry {
    pub fn new(notebook_id: NotebookId, author_id: AuthorId, content: impl Into<String>) -> Self {
        Self {
            id: EntryId::new(),
            notebook_id,
            content: content.into(),
            content_type: "text/plain".to_string(),
            author_id,
            signature: String::new(),
            topic: None,
            revision_of: None,
            fragment_of: None,
            fragment_index: None,
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

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = signature.into();
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Materialises the stored row once a sequence number is assigned.
    pub fn into_entry(self, sequence: i64, created_at: DateTime<Utc>) -> Entry {
        Entry {
            content_hash: content_hash(&self.content),
            id: self.id,
            notebook_id: self.notebook_id,
            content: self.content,
            content_type: self.content_type,
            author_id: self.author_id,
            signature: self.signature,
            sequence,
            created_at,
            topic: self.topic,
            revision_of: self.revision_of,
            fragment_of: self.fragment_of,
            fragment_index: self.fragment_index,
            references: self.references,
            claims: Vec::new(),
            claims_status: ClaimsStatus::Pending,
            embedding: None,
            max_friction: None,
            integration_cost: None,
            integration_status: IntegrationStatus::Probation,
            needs_review: false,
            metric_version: None,
            version: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobType {
    ExtractClaims,
    EmbedText,
    ScoreIntegration,
}

impl JobType {
    pub const ALL: [JobType; 3] = [
        JobType::ExtractClaims,
        JobType::EmbedText,
        JobType::ScoreIntegration,
    ];
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Claimed,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub notebook_id: NotebookId,
    pub entry_id: EntryId,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub timeout_seconds: i32,
    pub max_retries: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub notebook_id: NotebookId,
    pub entry_id: EntryId,
    pub job_type: JobType,
    pub status: JobStatus,
    pub payload: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub timeout_seconds: i32,
    pub retry_count: i32,
    pub max_retries: i32,
    pub priority: i32,
}

impl Job {
    pub fn from_new(new: NewJob, created_at: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            notebook_id: new.notebook_id,
            entry_id: new.entry_id,
            job_type: new.job_type,
            status: JobStatus::Pending,
            payload: new.payload,
            result: None,
            error: None,
            created_at,
            claimed_at: None,
            claimed_by: None,
            completed_at: None,
            timeout_seconds: new.timeout_seconds,
            retry_count: 0,
            max_retries: new.max_retries,
            priority: new.priority,
        }
    }

    pub fn lease_expires_at(&self) -> Option<DateTime<Utc>> {
        self.claimed_at
            .map(|at| at + Duration::seconds(i64::from(self.timeout_seconds)))
    }

    pub fn is_claim_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Claimed && self.lease_expires_at().is_some_and(|exp| exp <= now)
    }

    /// Pending, or a lapsed claim with retry budget left. A lapsed claim with
    /// no budget left is failed by reclamation instead.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Pending => true,
            JobStatus::Claimed => self.is_claim_expired(now) && self.retry_count < self.max_retries,
            JobStatus::Completed | JobStatus::Failed => false,
        }
    }

    /// Takes the lease. Taking over a lapsed claim spends one retry.
    pub fn take_claim(&mut self, worker_id: &str, now: DateTime<Utc>) {
        if self.status == JobStatus::Claimed {
            self.retry_count += 1;
        }
        self.status = JobStatus::Claimed;
        self.claimed_by = Some(worker_id.to_string());
        self.claimed_at = Some(now);
    }

    /// Applies the retry budget. Returns `true` when the job went back to
    /// `Pending`, `false` when it is now permanently `Failed`.
    pub fn record_failure(&mut self, error: &str, now: DateTime<Utc>) -> bool {
        self.error = Some(error.to_string());
        self.claimed_by = None;
        self.claimed_at = None;
        if self.retry_count < self.max_retries {
            self.retry_count += 1;
            self.status = JobStatus::Pending;
            true
        } else {
            self.status = JobStatus::Failed;
            self.completed_at = Some(now);
            false
        }
    }

    pub fn is_held_by(&self, worker_id: &str) -> bool {
        self.status == JobStatus::Claimed && self.claimed_by.as_deref() == Some(worker_id)
    }
}

/// Result of reporting a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum FailOutcome {
    Retrying(Job),
    Exhausted(Job),
}

impl FailOutcome {
    pub fn job(&self) -> &Job {
        match self {
            FailOutcome::Retrying(job) | FailOutcome::Exhausted(job) => job,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, FailOutcome::Exhausted(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReclaimReport {
    pub requeued: Vec<JobId>,
    pub exhausted: Vec<Job>,
}

impl ReclaimReport {
    pub fn count(&self) -> usize {
        self.requeued.len() + self.exhausted.len()
    }
}

// ---------------------------------------------------------------------------
// Mirroring
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionFilter {
    /// Topics to mirror. Empty mirrors every topic, including untopiced
    /// entries.
    #[serde(default)]
    pub topics: Vec<String>,
    /// Claims below this confidence stay behind.
    #[serde(default)]
    pub min_confidence: Option<f64>,
    #[serde(default)]
    pub include_embedding: bool,
}

impl SubscriptionFilter {
    pub fn matches_topic(&self, topic: Option<&str>) -> bool {
        self.topics.is_empty() || topic.is_some_and(|t| self.topics.iter().any(|f| f == t))
    }

    pub fn select_claims(&self, claims: &[Claim]) -> Vec<Claim> {
        claims
            .iter()
            .filter(|c| self.min_confidence.is_none_or(|min| c.confidence >= min))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub source_notebook_id: NotebookId,
    pub target_notebook_id: NotebookId,
    pub filter: SubscriptionFilter,
    /// Highest source sequence already mirrored.
    pub watermark: i64,
    pub created_by: AuthorId,
    pub created_at: DateTime<Utc>,
}

/// Distilled projection of a source entry. Carries no content, author or
/// signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirroredClaim {
    pub subscription_id: SubscriptionId,
    pub source_entry_id: EntryId,
    pub source_notebook_id: NotebookId,
    pub claims: Vec<Claim>,
    pub topic: Option<String>,
    pub embedding: Option<Vec<f32>>,
    pub source_sequence: i64,
    pub tombstoned: bool,
    pub mirrored_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AuditAction {
    CreateNotebook,
    WriteEntry,
    ReviseEntry,
    VerifyClaims,
    ShareNotebook,
    RevokeGrant,
    SetClearance,
    AddGroupMember,
    Subscribe,
    RetractEntry,
    ReadMirrors,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AuditOutcome {
    Allowed,
    Denied,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub notebook_id: Option<NotebookId>,
    pub actor: AuthorId,
    pub action: AuditAction,
    pub outcome: AuditOutcome,
    pub target: Option<String>,
    pub details: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        actor: AuthorId,
        action: AuditAction,
        outcome: AuditOutcome,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            notebook_id: None,
            actor,
            action,
            outcome,
            target: None,
            details: serde_json::Value::Null,
            occurred_at,
        }
    }

    pub fn on_notebook(mut self, notebook_id: NotebookId) -> Self {
        self.notebook_id = Some(notebook_id);
        self
    }

    pub fn with_target(mut self, target: impl fmt::Display) -> Self {
        self.target = Some(target.to_string());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn author(id: &str) -> AuthorId {
        AuthorId::new(id).unwrap()
    }

    fn job(max_retries: i32) -> Job {
        Job::from_new(
            NewJob {
                notebook_id: NotebookId::new(),
                entry_id: EntryId::new(),
                job_type: JobType::ExtractClaims,
                payload: serde_json::json!({}),
                priority: 0,
                timeout_seconds: 5,
                max_retries,
            },
            Utc::now(),
        )
    }

    #[test]
    fn test_claims_status_moves_forward_only() {
        use ClaimsStatus::*;

        assert!(Pending.can_transition_to(Distilled));
        assert!(Distilled.can_transition_to(Verified));
        assert!(Pending.can_transition_to(Failed));
        assert!(!Distilled.can_transition_to(Pending));
        assert!(!Verified.can_transition_to(Distilled));
        assert!(!Failed.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Distilled));
    }

    #[test]
    fn test_tier_ordering() {
        assert!(Tier::Owner.satisfies(Tier::Admin));
        assert!(Tier::Write.satisfies(Tier::Read));
        assert!(!Tier::Read.satisfies(Tier::Write));
        assert!(!Tier::None.satisfies(Tier::Read));
        assert_eq!("admin".parse::<Tier>().unwrap(), Tier::Admin);
    }

    #[test]
    fn test_grant_write_implies_read() {
        let grant = AccessGrant {
            notebook_id: NotebookId::new(),
            author_id: author("bob"),
            read: false,
            write: true,
            admin: false,
            granted_by: author("alice"),
            granted_at: Utc::now(),
        };
        assert_eq!(grant.tier(), Tier::Write);
        assert!(grant.tier().satisfies(Tier::Read));
    }

    #[test]
    fn test_clearance_covers_level_and_compartments() {
        let notebook = Notebook::new("ops", author("alice"), Utc::now())
            .with_classification(Classification::Confidential)
            .with_compartment("orion");

        let mut clearance = Clearance {
            author_id: author("bob"),
            level: Classification::Secret,
            compartments: BTreeSet::new(),
        };
        assert!(!clearance.covers(&notebook));

        clearance.compartments.insert("orion".to_string());
        assert!(clearance.covers(&notebook));

        clearance.level = Classification::Internal;
        assert!(!clearance.covers(&notebook));
    }

    #[test]
    fn test_notebook_label_dominance() {
        let open = Notebook::new("open", author("alice"), Utc::now());
        let secret = Notebook::new("s", author("alice"), Utc::now())
            .with_classification(Classification::Secret);
        let secret_orion = secret.clone().with_compartment("orion");
        let internal_orion = Notebook::new("i", author("alice"), Utc::now())
            .with_classification(Classification::Internal)
            .with_compartment("orion");

        assert!(open.dominates(&open));
        assert!(secret.dominates(&open));
        assert!(!open.dominates(&secret));
        assert!(secret_orion.dominates(&secret));
        assert!(!secret.dominates(&secret_orion));
        assert!(!internal_orion.dominates(&secret_orion));
        assert_eq!(open.label(), "unlabelled");
        assert_eq!(secret_orion.label(), "secret[orion]");
    }

    #[test]
    fn test_record_failure_respects_budget() {
        let mut job = job(3);
        let now = Utc::now();
        let mut attempts = 0;
        loop {
            job.take_claim("w", now);
            attempts += 1;
            if !job.record_failure("boom", now) {
                break;
            }
        }
        assert_eq!(attempts, 4);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 3);
    }

    #[test]
    fn test_expired_claim_is_claimable_and_spends_retry() {
        let mut job = job(2);
        let start = Utc::now();
        job.take_claim("w1", start);
        assert!(!job.is_claimable(start + Duration::seconds(4)));
        assert!(job.is_claimable(start + Duration::seconds(5)));

        job.take_claim("w2", start + Duration::seconds(5));
        assert_eq!(job.retry_count, 1);
        assert!(job.is_held_by("w2"));
        assert!(!job.is_held_by("w1"));
    }

    #[test]
    fn test_subscription_filter() {
        let filter = SubscriptionFilter {
            topics: vec!["weather".to_string()],
            min_confidence: Some(0.5),
            include_embedding: false,
        };
        assert!(filter.matches_topic(Some("weather")));
        assert!(!filter.matches_topic(Some("sports")));
        assert!(!filter.matches_topic(None));

        let claims = vec![Claim::new("sky is blue", 0.9), Claim::new("maybe rain", 0.2)];
        assert_eq!(filter.select_claims(&claims).len(), 1);
        assert!(SubscriptionFilter::default().matches_topic(None));
    }

    #[test]
    fn test_new_entry_materialises_pending() {
        let entry = NewEntry::new(NotebookId::new(), author("alice"), "the sky is blue")
            .with_topic("weather")
            .into_entry(1, Utc::now());
        assert_eq!(entry.claims_status, ClaimsStatus::Pending);
        assert_eq!(entry.integration_status, IntegrationStatus::Probation);
        assert_eq!(entry.content_hash, content_hash("the sky is blue"));
        assert!(!entry.is_ready_for_integration());
    }
}
