//! # Knowledge Pipeline
//!
//! Entry lifecycle for append-only notebooks: sequenced writes, claim
//! extraction and embedding jobs, integration scoring against neighboring
//! entries, and tiered access control.

pub mod access;
pub mod events;
pub mod friction;
pub mod integration;
pub mod ledger;
pub mod notebook;
pub mod pipeline;
pub mod retry;
pub mod worker;

pub use access::AccessControl;
pub use events::{EventBus, NotebookEvent};
pub use integration::{Assessment, IntegrationEngine, ScoreOutcome, assess};
pub use ledger::JobLedger;
pub use notebook::{
    CreateNotebook, NotebookService, Permissions, WriteEntry, WriteReceipt, split_fragments,
};
pub use pipeline::Pipeline;
pub use retry::on_contention;
pub use worker::{JobOutcome, Worker};
