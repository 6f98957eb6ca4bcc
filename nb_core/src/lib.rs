//! # Notebook Core
//!
//! Shared types and traits for the notebook substrate.
//!
//! This crate provides:
//! - Domain types: notebooks, entries, claims, jobs, subscriptions, mirrors,
//!   grants and audit records
//! - Store traits implemented by every storage backend
//! - The [`clock::Clock`] seam used for lease and timeout arithmetic
//! - The [`traits::ContentProcessor`] seam for the external extraction and
//!   embedding collaborator

pub mod clock;
pub mod traits;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use traits::{
    AccessStore, AuditStore, ContentProcessor, EntryStore, JobStore, MirrorStore, NotebookStore,
    ProcessorError, StorageResult,
};
pub use types::{
    AccessGrant, AuditAction, AuditEvent, AuditOutcome, AuthorId, Claim, ClaimsStatus,
    Classification, Clearance, Entry, EntryId, FailOutcome, GroupId, GroupMembership, GroupRole,
    IntegrationCost, IntegrationStatus, IntegrationUpdate, Job, JobId, JobStatus, JobType,
    MirroredClaim, NewEntry, NewJob, Notebook, NotebookId, ReclaimReport, Subscription,
    SubscriptionFilter, SubscriptionId, Tier,
};
