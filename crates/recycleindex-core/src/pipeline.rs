//! The shared normalize → apply path used by both the live and the resync
//! drivers.

use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::applier::{ApplyOutcome, Applier};
use crate::error::IndexerError;
use crate::feed::FeedEvent;
use crate::normalize::Normalizer;
use crate::types::IndexPhase;

/// Counters snapshot for the pipeline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineMetrics {
    pub events_received: u64,
    pub events_applied: u64,
    /// Malformed events and abandoned toxic items.
    pub events_dropped: u64,
    pub events_failed: u64,
}

pub struct Pipeline {
    normalizer: Normalizer,
    applier: Applier,
    metrics: Mutex<PipelineMetrics>,
}

impl Pipeline {
    pub fn new(normalizer: Normalizer, applier: Applier) -> Self {
        Self {
            normalizer,
            applier,
            metrics: Mutex::new(PipelineMetrics::default()),
        }
    }

    pub fn metrics(&self) -> PipelineMetrics {
        self.lock_metrics().clone()
    }

    fn lock_metrics(&self) -> std::sync::MutexGuard<'_, PipelineMetrics> {
        self.metrics.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Normalize and apply one event. Failures are logged and counted here;
    /// the caller only decides whether to keep going.
    pub async fn process(
        &self,
        event: &FeedEvent,
        phase: IndexPhase,
        cancel: &CancellationToken,
    ) -> Result<ApplyOutcome, IndexerError> {
        self.lock_metrics().events_received += 1;

        let result = self.run(event, phase, cancel).await;
        let kind = event.kind();
        let block = event.meta.block_number;

        let mut metrics = self.lock_metrics();
        match &result {
            Ok(ApplyOutcome::Applied(_)) => metrics.events_applied += 1,
            Ok(ApplyOutcome::Dropped) => metrics.events_dropped += 1,
            Err(IndexerError::Cancelled) => {
                metrics.events_failed += 1;
                debug!(%kind, %phase, "event abandoned by shutdown");
            }
            Err(e) if e.is_dropped() => {
                metrics.events_dropped += 1;
                warn!(%kind, %phase, ?block, error = %e, "event dropped");
            }
            Err(e) => {
                metrics.events_failed += 1;
                error!(%kind, %phase, ?block, error = %e, "event failed");
            }
        }
        result
    }

    async fn run(
        &self,
        event: &FeedEvent,
        phase: IndexPhase,
        cancel: &CancellationToken,
    ) -> Result<ApplyOutcome, IndexerError> {
        // Live events must be anchored to a block; replays may fall back to now.
        if phase == IndexPhase::Live && event.meta.block_number.is_none() {
            return Err(IndexerError::malformed(
                event.kind().name(),
                "missing block number",
            ));
        }
        let record = self.normalizer.normalize(event).await?;
        self.applier.apply(record, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{EventMeta, EventPayload, MemoryFeed};
    use crate::store::MemoryStore;
    use crate::timestamp::TimestampResolver;
    use std::sync::Arc;

    fn pipeline() -> (Arc<MemoryStore>, Pipeline) {
        let feed = Arc::new(MemoryFeed::new());
        feed.insert_block(10, 1_000);
        let store = Arc::new(MemoryStore::new());
        let p = Pipeline::new(
            Normalizer::new(Arc::new(TimestampResolver::new(feed))),
            Applier::new(store.clone()),
        );
        (store, p)
    }

    fn registered(meta: EventMeta) -> FeedEvent {
        FeedEvent::new(
            EventPayload::ManufacturerRegistered {
                id: "m1".into(),
                name: "Acme".into(),
                location: "NY".into(),
                contact: "c@acme.com".into(),
            },
            meta,
        )
    }

    #[tokio::test]
    async fn live_event_without_block_is_dropped() {
        let (store, p) = pipeline();
        let err = p
            .process(&registered(EventMeta::default()), IndexPhase::Live, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, IndexerError::MalformedEvent { .. }));
        assert!(store.manufacturer("m1").is_none());
        assert_eq!(p.metrics().events_dropped, 1);
    }

    #[tokio::test]
    async fn backfill_event_without_block_uses_now() {
        let (store, p) = pipeline();
        p.process(
            &registered(EventMeta::default()),
            IndexPhase::Backfill,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(store.manufacturer("m1").is_some());
    }

    #[tokio::test]
    async fn failures_are_counted() {
        let (_, p) = pipeline();
        let cancel = CancellationToken::new();
        let ev = registered(EventMeta::at_block(10));
        p.process(&ev, IndexPhase::Live, &cancel).await.unwrap();
        assert!(p.process(&ev, IndexPhase::Live, &cancel).await.is_err());

        assert_eq!(
            p.metrics(),
            PipelineMetrics {
                events_received: 2,
                events_applied: 1,
                events_dropped: 0,
                events_failed: 1,
            }
        );
    }
}
