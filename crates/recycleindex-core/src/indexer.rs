//! Indexer configuration, builder and the service tying the drivers together.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use recycleindex_core::{IndexerBuilder, MemoryFeed, MemoryStore};
//!
//! # async fn run() -> Result<(), recycleindex_core::IndexerError> {
//! let indexer = IndexerBuilder::new()
//!     .start_block(1_200_000)
//!     .resync_on_start(true)
//!     .build(Arc::new(MemoryFeed::new()), Arc::new(MemoryStore::new()));
//! indexer.init().await?;
//! // ...
//! indexer.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::applier::{Applier, OrphanPolicy, ToxicRetryConfig};
use crate::error::IndexerError;
use crate::feed::Feed;
use crate::live::LiveSubscription;
use crate::normalize::Normalizer;
use crate::pipeline::{Pipeline, PipelineMetrics};
use crate::resync::{ResyncEngine, ResyncReport};
use crate::store::Store;
use crate::timestamp::{TimestampResolver, DEFAULT_CACHE_BLOCKS};

// ─── Config ───────────────────────────────────────────────────────────────────

/// Configuration for an indexer instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    /// Name used in logs.
    pub id: String,
    /// First block replayed by the startup resync.
    pub start_block: u64,
    /// Replay `start_block → head` before subscribing.
    pub resync_on_start: bool,
    /// Block timestamps kept in memory.
    pub timestamp_cache_blocks: usize,
    pub toxic_retry: ToxicRetryConfig,
    pub orphan_policy: OrphanPolicy,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            id: "recycleindex".into(),
            start_block: 0,
            resync_on_start: false,
            timestamp_cache_blocks: DEFAULT_CACHE_BLOCKS,
            toxic_retry: ToxicRetryConfig::default(),
            orphan_policy: OrphanPolicy::default(),
        }
    }
}

/// Runtime state of the indexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexerState {
    /// Not yet started.
    Idle,
    /// Replaying history before going live.
    Backfilling,
    /// Following the live feed.
    Live,
    /// Terminated.
    Stopped,
}

impl std::fmt::Display for IndexerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Backfilling => write!(f, "backfilling"),
            Self::Live => write!(f, "live"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

// ─── Builder ──────────────────────────────────────────────────────────────────

/// Fluent builder for [`IndexerConfig`] and [`Indexer`].
#[derive(Default)]
pub struct IndexerBuilder {
    config: IndexerConfig,
}

impl IndexerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.config.id = id.into();
        self
    }

    /// Set the first block of the startup resync.
    pub fn start_block(mut self, block: u64) -> Self {
        self.config.start_block = block;
        self
    }

    pub fn resync_on_start(mut self, enabled: bool) -> Self {
        self.config.resync_on_start = enabled;
        self
    }

    pub fn timestamp_cache_blocks(mut self, blocks: usize) -> Self {
        self.config.timestamp_cache_blocks = blocks;
        self
    }

    /// Set the toxic-item parent wait (attempts, fixed delay).
    pub fn toxic_retry(mut self, max_attempts: u32, delay_ms: u64) -> Self {
        self.config.toxic_retry = ToxicRetryConfig {
            max_attempts,
            delay_ms,
        };
        self
    }

    pub fn orphan_policy(mut self, policy: OrphanPolicy) -> Self {
        self.config.orphan_policy = policy;
        self
    }

    pub fn build_config(self) -> IndexerConfig {
        self.config
    }

    pub fn build(self, feed: Arc<dyn Feed>, store: Arc<dyn Store>) -> Indexer {
        Indexer::new(self.config, feed, store)
    }
}

// ─── Indexer ──────────────────────────────────────────────────────────────────

/// Owns the feed connection and both drivers.
pub struct Indexer {
    config: IndexerConfig,
    pipeline: Arc<Pipeline>,
    live: LiveSubscription,
    resync: ResyncEngine,
    shutdown: CancellationToken,
    state: Mutex<IndexerState>,
}

impl Indexer {
    pub fn new(config: IndexerConfig, feed: Arc<dyn Feed>, store: Arc<dyn Store>) -> Self {
        let timestamps = Arc::new(TimestampResolver::with_capacity(
            Arc::clone(&feed),
            config.timestamp_cache_blocks,
        ));
        let applier = Applier::new(store)
            .with_retry(config.toxic_retry.clone())
            .with_orphan_policy(config.orphan_policy);
        let pipeline = Arc::new(Pipeline::new(Normalizer::new(timestamps), applier));

        let shutdown = CancellationToken::new();
        let live = LiveSubscription::new(Arc::clone(&feed), Arc::clone(&pipeline))
            .with_cancellation(shutdown.child_token());
        let resync = ResyncEngine::new(feed, Arc::clone(&pipeline))
            .with_cancellation(shutdown.child_token());

        Self {
            config,
            pipeline,
            live,
            resync,
            shutdown,
            state: Mutex::new(IndexerState::Idle),
        }
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    pub fn state(&self) -> IndexerState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: IndexerState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Optional startup resync, then the live subscription.
    ///
    /// Returns the startup resync report when one ran. A failed startup
    /// resync leaves the indexer `Idle` (live was never touched); a failed
    /// live start is terminal (`Stopped`).
    pub async fn init(&self) -> Result<Option<ResyncReport>, IndexerError> {
        let state = self.state();
        if state != IndexerState::Idle {
            return Err(IndexerError::InvalidState {
                operation: "init".into(),
                state: state.to_string(),
            });
        }
        info!(indexer = %self.config.id, "indexer starting");

        let report = if self.config.resync_on_start {
            self.set_state(IndexerState::Backfilling);
            match self.resync.resync_to_head(self.config.start_block).await {
                Ok(report) => Some(report),
                Err(e) => {
                    self.set_state(IndexerState::Idle);
                    return Err(e);
                }
            }
        } else {
            None
        };

        // A partial start leaves workers for the kinds that did subscribe;
        // tear them down and refuse further use.
        if let Err(e) = self.live.start().await {
            if let Err(stop_err) = self.live.stop().await {
                warn!(indexer = %self.config.id, error = %stop_err, "teardown after failed start");
            }
            self.set_state(IndexerState::Stopped);
            return Err(e);
        }
        self.set_state(IndexerState::Live);
        info!(indexer = %self.config.id, "indexer live");
        Ok(report)
    }

    /// Stop the live subscription and abort pending retry waits. Idempotent.
    pub async fn shutdown(&self) -> Result<(), IndexerError> {
        if self.state() == IndexerState::Stopped {
            return Ok(());
        }
        self.shutdown.cancel();
        self.live.stop().await?;
        self.set_state(IndexerState::Stopped);
        info!(indexer = %self.config.id, "indexer stopped");
        Ok(())
    }

    /// Replay `[from, to]`; may run while live is active.
    pub async fn resync(&self, from: u64, to: u64) -> Result<ResyncReport, IndexerError> {
        self.resync.resync(from, to).await
    }

    pub async fn resync_to_head(&self, from: u64) -> Result<ResyncReport, IndexerError> {
        self.resync.resync_to_head(from).await
    }

    pub fn metrics(&self) -> PipelineMetrics {
        self.pipeline.metrics()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::MemoryFeed;
    use crate::store::MemoryStore;

    #[test]
    fn builder_defaults() {
        let cfg = IndexerBuilder::new().build_config();
        assert_eq!(cfg.start_block, 0);
        assert!(!cfg.resync_on_start);
        assert_eq!(cfg.toxic_retry.max_attempts, 5);
        assert_eq!(cfg.toxic_retry.delay_ms, 1_000);
        assert_eq!(cfg.orphan_policy, OrphanPolicy::Drop);
        assert_eq!(cfg.timestamp_cache_blocks, 256);
    }

    #[test]
    fn builder_custom() {
        let cfg = IndexerBuilder::new()
            .id("recycle-mainnet")
            .start_block(1_000)
            .resync_on_start(true)
            .toxic_retry(3, 250)
            .orphan_policy(OrphanPolicy::Error)
            .build_config();
        assert_eq!(cfg.id, "recycle-mainnet");
        assert_eq!(cfg.start_block, 1_000);
        assert!(cfg.resync_on_start);
        assert_eq!(cfg.toxic_retry.max_attempts, 3);
        assert_eq!(cfg.orphan_policy, OrphanPolicy::Error);
    }

    #[test]
    fn config_fills_missing_fields() {
        let cfg: IndexerConfig =
            serde_json::from_str(r#"{"start_block": 42, "orphan_policy": "error"}"#).unwrap();
        assert_eq!(cfg.start_block, 42);
        assert_eq!(cfg.orphan_policy, OrphanPolicy::Error);
        assert_eq!(cfg.toxic_retry.max_attempts, 5);
    }

    #[tokio::test]
    async fn init_and_shutdown() {
        let feed = Arc::new(MemoryFeed::new());
        let indexer = IndexerBuilder::new().build(feed.clone(), Arc::new(MemoryStore::new()));

        assert!(indexer.init().await.unwrap().is_none());
        assert_eq!(indexer.state(), IndexerState::Live);
        assert_eq!(feed.subscriber_count(), 5);
        assert!(indexer.init().await.is_err());

        indexer.shutdown().await.unwrap();
        indexer.shutdown().await.unwrap();
        assert_eq!(indexer.state(), IndexerState::Stopped);
        assert!(!feed.is_connected());
    }

    #[tokio::test]
    async fn failed_startup_resync_leaves_indexer_idle() {
        let feed = Arc::new(MemoryFeed::new());
        feed.set_offline(true);
        let indexer = IndexerBuilder::new()
            .resync_on_start(true)
            .build(feed.clone(), Arc::new(MemoryStore::new()));

        assert!(matches!(indexer.init().await, Err(IndexerError::Feed(_))));
        assert_eq!(indexer.state(), IndexerState::Idle);
        assert_eq!(feed.subscriber_count(), 0);
    }
}
