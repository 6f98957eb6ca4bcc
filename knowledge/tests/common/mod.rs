//! Harness shared by the knowledge integration tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use config::Config;
use knowledge::{EventBus, NotebookService, Worker};
use nb_core::{AuthorId, Claim, ContentProcessor, ManualClock, ProcessorError};
use observability::{AuditConsumer, AuditSink};
use storage::InMemoryBackend;

pub fn author(id: &str) -> AuthorId {
    AuthorId::new(id).unwrap()
}

/// Returns the content as a single claim and a fixed embedding.
pub struct StubProcessor {
    pub embedding: Vec<f32>,
    pub fail_extraction: bool,
    pub extractions: AtomicUsize,
    pub delay: Option<Duration>,
}

impl StubProcessor {
    pub fn new() -> Self {
        Self {
            embedding: vec![1.0, 0.0, 0.0],
            fail_extraction: false,
            extractions: AtomicUsize::new(0),
            delay: None,
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_extraction: true,
            ..Self::new()
        }
    }

    /// Sleeps for `delay` before answering each call.
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::new()
        }
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl ContentProcessor for StubProcessor {
    async fn extract_claims(
        &self,
        content: &str,
        _content_type: &str,
    ) -> Result<Vec<Claim>, ProcessorError> {
        self.extractions.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        if self.fail_extraction {
            return Err(ProcessorError::Unavailable("model offline".to_string()));
        }
        Ok(vec![Claim::new(content, 0.9)])
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProcessorError> {
        self.pause().await;
        Ok(self.embedding.clone())
    }
}

pub struct Harness {
    pub store: Arc<InMemoryBackend>,
    pub clock: Arc<ManualClock>,
    pub service: NotebookService,
    pub events: EventBus,
    pub audit: Option<AuditConsumer>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(InMemoryBackend::with_clock(clock.clone()));
        let (sink, consumer) = AuditSink::channel(256);
        let events = EventBus::default();
        let service = NotebookService::new(store.clone(), &config, sink, events.clone())
            .with_clock(clock.clone());
        Self {
            store,
            clock,
            service,
            events,
            audit: Some(consumer),
        }
    }

    pub fn worker(&self, id: &str, processor: Arc<StubProcessor>) -> Worker {
        Worker::new(
            id,
            self.service.pipeline(),
            processor,
            &Config::default().jobs,
        )
    }
}

/// Runs `worker` until no job is left for it.
pub async fn drain(worker: &Worker) -> usize {
    let mut processed = 0;
    while worker.run_once().await.unwrap().is_some() {
        processed += 1;
    }
    processed
}
