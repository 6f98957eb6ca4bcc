//! # Claim Mirroring
//!
//! One-way replication of distilled claims from a source notebook into the
//! subscribing target notebook, in source sequence order and honoring
//! retractions.

pub mod pump;
pub mod replicator;
pub mod service;

pub use pump::MirrorPump;
pub use replicator::{MirrorReplicator, PumpReport};
pub use service::MirrorService;
