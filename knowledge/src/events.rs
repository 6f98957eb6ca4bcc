//! In-process notification channel.
//!
//! Publishing never waits: slow receivers lag and lose the oldest events,
//! and publishing with no receivers is a no-op.

use nb_core::{
    ClaimsStatus, EntryId, IntegrationStatus, JobId, JobType, NotebookId, SubscriptionId,
};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotebookEvent {
    EntryWritten {
        notebook_id: NotebookId,
        entry_id: EntryId,
        sequence: i64,
    },
    ClaimsUpdated {
        notebook_id: NotebookId,
        entry_id: EntryId,
        status: ClaimsStatus,
    },
    IntegrationScored {
        notebook_id: NotebookId,
        entry_id: EntryId,
        status: IntegrationStatus,
        max_friction: f64,
    },
    StageFailed {
        notebook_id: NotebookId,
        entry_id: EntryId,
        job_type: JobType,
        error: String,
    },
    JobExhausted {
        job_id: JobId,
        entry_id: EntryId,
        job_type: JobType,
    },
    MirrorsApplied {
        subscription_id: SubscriptionId,
        count: usize,
        watermark: i64,
    },
    EntryRetracted {
        entry_id: EntryId,
        tombstoned: u64,
    },
}

impl NotebookEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            NotebookEvent::EntryWritten { .. } => "entry_written",
            NotebookEvent::ClaimsUpdated { .. } => "claims_updated",
            NotebookEvent::IntegrationScored { .. } => "integration_scored",
            NotebookEvent::StageFailed { .. } => "stage_failed",
            NotebookEvent::JobExhausted { .. } => "job_exhausted",
            NotebookEvent::MirrorsApplied { .. } => "mirrors_applied",
            NotebookEvent::EntryRetracted { .. } => "entry_retracted",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<NotebookEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NotebookEvent> {
        self.tx.subscribe()
    }

    /// Returns the number of receivers the event reached.
    pub fn publish(&self, event: NotebookEvent) -> usize {
        let kind = event.kind();
        let delivered = self.tx.send(event).unwrap_or(0);
        trace!(kind, delivered, "Published event");
        delivered
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retracted(n: u64) -> NotebookEvent {
        NotebookEvent::EntryRetracted {
            entry_id: EntryId::new(),
            tombstoned: n,
        }
    }

    #[test]
    fn test_publish_without_receivers_is_noop() {
        let bus = EventBus::default();
        assert_eq!(bus.publish(retracted(1)), 0);
    }

    #[tokio::test]
    async fn test_receivers_see_events_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(retracted(1));
        bus.publish(retracted(2));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(matches!(first, NotebookEvent::EntryRetracted { tombstoned: 1, .. }));
        assert!(matches!(second, NotebookEvent::EntryRetracted { tombstoned: 2, .. }));
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let json = serde_json::to_value(retracted(3)).unwrap();
        assert_eq!(json["type"], "entry_retracted");
        assert_eq!(json["tombstoned"], 3);
    }
}
