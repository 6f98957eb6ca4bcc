//! Bounded, non-blocking audit sink.
//!
//! Producers hand events to [`AuditSink::record`], which never waits: when
//! the queue is full the event is dropped, a warning is logged and
//! `audit.dropped` is incremented. A single [`AuditConsumer`] drains the
//! queue in batches into an [`AuditStore`].

use std::sync::Arc;

use config::AuditConfig;
use nb_core::{AuditEvent, AuditStore};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuditError {
    #[error("Audit queue is full")]
    QueueFull,

    #[error("Audit consumer has shut down")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct AuditSink {
    tx: mpsc::Sender<AuditEvent>,
}

impl AuditSink {
    /// Creates the queue without starting a consumer.
    pub fn channel(capacity: usize) -> (Self, AuditConsumer) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, AuditConsumer { rx })
    }

    /// Creates the queue and spawns its consumer on the current runtime.
    pub fn spawn(
        store: Arc<dyn AuditStore>,
        config: &AuditConfig,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (sink, consumer) = Self::channel(config.queue_capacity);
        let batch_size = config.batch_size;
        let handle = tokio::spawn(consumer.run(store, batch_size, cancel));
        (sink, handle)
    }

    pub fn try_record(&self, event: AuditEvent) -> Result<(), AuditError> {
        self.tx.try_send(event).map_err(|e| match e {
            TrySendError::Full(_) => AuditError::QueueFull,
            TrySendError::Closed(_) => AuditError::Closed,
        })
    }

    /// Enqueues `event`. A full or closed queue drops it.
    pub fn record(&self, event: AuditEvent) {
        let action = event.action;
        let actor = event.actor.clone();
        if let Err(e) = self.try_record(event) {
            warn!(%action, %actor, error = %e, "Dropping audit event");
            metrics::record_audit_dropped();
        }
    }
}

pub struct AuditConsumer {
    rx: mpsc::Receiver<AuditEvent>,
}

impl AuditConsumer {
    /// Drains the queue until every sink is dropped or `cancel` fires, then
    /// flushes whatever is still buffered.
    pub async fn run(
        mut self,
        store: Arc<dyn AuditStore>,
        batch_size: usize,
        cancel: CancellationToken,
    ) {
        let batch_size = batch_size.max(1);
        let mut batch = Vec::with_capacity(batch_size);

        loop {
            let received = tokio::select! {
                n = self.rx.recv_many(&mut batch, batch_size) => n,
                () = cancel.cancelled() => break,
            };
            if received == 0 {
                debug!("Audit queue closed");
                return;
            }
            flush(store.as_ref(), &mut batch).await;
        }

        self.rx.close();
        while let Ok(event) = self.rx.try_recv() {
            batch.push(event);
            if batch.len() >= batch_size {
                flush(store.as_ref(), &mut batch).await;
            }
        }
        flush(store.as_ref(), &mut batch).await;
        debug!("Audit consumer cancelled");
    }
}

async fn flush(store: &dyn AuditStore, batch: &mut Vec<AuditEvent>) {
    if batch.is_empty() {
        return;
    }
    match store.append_audit(batch).await {
        Ok(()) => metrics::record_audit_written(batch.len()),
        Err(e) => {
            warn!(error = %e, count = batch.len(), "Failed to write audit batch");
            metrics::record_audit_write_failed(batch.len());
        }
    }
    batch.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};
    use nb_core::{AuditAction, AuditOutcome, AuthorId};
    use storage::InMemoryBackend;

    fn event(target: usize) -> AuditEvent {
        AuditEvent::new(
            AuthorId::new("alice").unwrap(),
            AuditAction::WriteEntry,
            AuditOutcome::Allowed,
            Utc::now(),
        )
        .with_target(target)
    }

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let (sink, _consumer) = AuditSink::channel(2);
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        ::metrics::with_local_recorder(&recorder, || {
            for i in 0..5 {
                sink.record(event(i));
            }
        });

        let dropped: u64 = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .filter(|(key, _, _, _)| key.key().name() == crate::metrics::AUDIT_DROPPED)
            .map(|(_, _, _, value)| match value {
                DebugValue::Counter(n) => n,
                _ => 0,
            })
            .sum();
        assert_eq!(dropped, 3);
        assert_eq!(sink.try_record(event(9)), Err(AuditError::QueueFull));
    }

    #[test]
    fn test_closed_queue_reports_closed() {
        let (sink, consumer) = AuditSink::channel(4);
        drop(consumer);
        assert_eq!(sink.try_record(event(0)), Err(AuditError::Closed));
    }

    #[tokio::test]
    async fn test_consumer_writes_and_exits_when_sinks_drop() {
        let store = Arc::new(InMemoryBackend::new());
        let (sink, consumer) = AuditSink::channel(16);
        for i in 0..10 {
            sink.record(event(i));
        }
        drop(sink);

        consumer
            .run(store.clone(), 3, CancellationToken::new())
            .await;

        let written = store.list_audit(None, 100).await.unwrap();
        assert_eq!(written.len(), 10);
    }

    #[tokio::test]
    async fn test_cancel_flushes_buffered_events() {
        let store = Arc::new(InMemoryBackend::new());
        let cancel = CancellationToken::new();
        let (sink, consumer) = AuditSink::channel(16);
        cancel.cancel();
        for i in 0..4 {
            sink.record(event(i));
        }

        consumer.run(store.clone(), 8, cancel).await;

        assert_eq!(store.list_audit(None, 100).await.unwrap().len(), 4);
        assert_eq!(sink.try_record(event(5)), Err(AuditError::Closed));
    }
}
