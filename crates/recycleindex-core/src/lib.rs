//! recycleindex-core: ingestion and reconciliation engine for the
//! RecycleChain ledger.
//!
//! # Architecture
//!
//! ```text
//! IndexerBuilder → Indexer
//!                    ├── LiveSubscription (one worker per event kind)
//!                    ├── ResyncEngine     (historical replay, fixed kind order)
//!                    └── Pipeline
//!                          ├── Normalizer ── TimestampResolver ── Feed
//!                          └── Applier    ── Store (memory / SQLite)
//! ```

pub mod applier;
pub mod error;
pub mod feed;
pub mod indexer;
pub mod live;
pub mod normalize;
pub mod pipeline;
pub mod resync;
pub mod status;
pub mod store;
pub mod timestamp;
pub mod types;

pub use applier::{ApplyOutcome, Applier, OrphanPolicy, ToxicRetryConfig};
pub use error::IndexerError;
pub use feed::{EventKind, EventMeta, EventPayload, EventReceiver, Feed, FeedEvent, MemoryFeed};
pub use indexer::{Indexer, IndexerBuilder, IndexerConfig, IndexerState};
pub use live::{LiveState, LiveSubscription};
pub use normalize::{CanonicalRecord, Normalizer, ProductItemBatch, StatusUpdate};
pub use pipeline::{Pipeline, PipelineMetrics};
pub use resync::{KindReport, ResyncEngine, ResyncReport};
pub use status::{map_status, LifecycleStatus};
pub use store::{MemoryStore, Store, StoreSnapshot, WriteOp, WriteSummary};
pub use timestamp::TimestampResolver;
pub use types::{EntityKind, IndexPhase, Manufacturer, Product, ProductItem, ToxicItem, Transaction};
