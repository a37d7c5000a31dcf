//! The `Feed` trait (the ledger event source) and an in-memory feed.
//!
//! A feed delivers the five RecycleChain contract events either pushed over a
//! live subscription (one ordered channel per event kind) or pulled by
//! historical block range. Decoding of raw logs happens behind this trait.

use alloy_primitives::U256;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

use crate::error::IndexerError;

// ─── EventKind ────────────────────────────────────────────────────────────────

/// The contract events the indexer consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    ManufacturerRegistered,
    ProductCreated,
    ProductItemsAdded,
    ProductItemsStatusChanged,
    ToxicItemCreated,
}

impl EventKind {
    /// Every kind, in resync replay order.
    pub const ALL: [EventKind; 5] = [
        EventKind::ManufacturerRegistered,
        EventKind::ProductCreated,
        EventKind::ProductItemsAdded,
        EventKind::ProductItemsStatusChanged,
        EventKind::ToxicItemCreated,
    ];

    /// The Solidity event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ManufacturerRegistered => "ManufacturerRegistered",
            Self::ProductCreated => "ProductCreated",
            Self::ProductItemsAdded => "ProductItemsAdded",
            Self::ProductItemsStatusChanged => "ProductItemsStatusChanged",
            Self::ToxicItemCreated => "ToxicItemCreated",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ─── FeedEvent ────────────────────────────────────────────────────────────────

/// Log metadata attached to every event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventMeta {
    /// Block that emitted the log. Pending logs carry none.
    pub block_number: Option<u64>,
    pub log_index: Option<u32>,
    pub tx_hash: Option<String>,
}

impl EventMeta {
    pub fn at_block(block_number: u64) -> Self {
        Self {
            block_number: Some(block_number),
            ..Default::default()
        }
    }
}

/// Positional event arguments, as emitted by the contract.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    ManufacturerRegistered {
        id: String,
        name: String,
        location: String,
        contact: String,
    },
    ProductCreated {
        product_id: U256,
        name: String,
        manufacturer: String,
    },
    ProductItemsAdded {
        product_item_ids: Vec<String>,
        product_id: U256,
    },
    ProductItemsStatusChanged {
        product_item_ids: Vec<String>,
        status_index: U256,
    },
    ToxicItemCreated {
        product_id: U256,
        name: String,
        weight: U256,
    },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ManufacturerRegistered { .. } => EventKind::ManufacturerRegistered,
            Self::ProductCreated { .. } => EventKind::ProductCreated,
            Self::ProductItemsAdded { .. } => EventKind::ProductItemsAdded,
            Self::ProductItemsStatusChanged { .. } => EventKind::ProductItemsStatusChanged,
            Self::ToxicItemCreated { .. } => EventKind::ToxicItemCreated,
        }
    }
}

/// A typed ledger event.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedEvent {
    pub payload: EventPayload,
    pub meta: EventMeta,
}

impl FeedEvent {
    pub fn new(payload: EventPayload, meta: EventMeta) -> Self {
        Self { payload, meta }
    }

    /// Shorthand for an event carrying only a block number.
    pub fn at_block(payload: EventPayload, block_number: u64) -> Self {
        Self::new(payload, EventMeta::at_block(block_number))
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

// ─── Feed trait ───────────────────────────────────────────────────────────────

/// Ordered stream of live events for a single kind.
pub type EventReceiver = mpsc::Receiver<FeedEvent>;

/// Source of ledger events, live and historical.
#[async_trait]
pub trait Feed: Send + Sync {
    /// Open the persistent connection.
    async fn connect(&self) -> Result<(), IndexerError>;

    /// Register for live events of one kind. Delivery order within the
    /// returned channel follows the ledger.
    async fn subscribe(&self, kind: EventKind) -> Result<EventReceiver, IndexerError>;

    /// Deregister every live subscription.
    async fn unsubscribe_all(&self) -> Result<(), IndexerError>;

    /// Release the connection. Safe to call when not connected.
    async fn disconnect(&self) -> Result<(), IndexerError>;

    /// All events of `kind` in the closed block range `[from, to]`.
    async fn query_historical(
        &self,
        kind: EventKind,
        from: u64,
        to: u64,
    ) -> Result<Vec<FeedEvent>, IndexerError>;

    /// Block timestamp in seconds since epoch; `None` if the block is unknown.
    async fn block_timestamp(&self, block_number: u64) -> Result<Option<i64>, IndexerError>;

    async fn current_block_number(&self) -> Result<u64, IndexerError>;
}

// ─── In-memory feed ───────────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryFeedState {
    connected: bool,
    offline: bool,
    blocks: HashMap<u64, i64>,
    history: Vec<FeedEvent>,
    subscribers: HashMap<EventKind, mpsc::Sender<FeedEvent>>,
    head: u64,
}

/// In-memory feed for tests and offline replays.
///
/// Events passed to [`MemoryFeed::emit`] are recorded in the history (so a
/// later resync sees them) and pushed to the live subscriber of their kind.
pub struct MemoryFeed {
    state: Mutex<MemoryFeedState>,
    channel_capacity: usize,
    block_lookups: AtomicU64,
}

impl Default for MemoryFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFeed {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryFeedState::default()),
            channel_capacity: 256,
            block_lookups: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryFeedState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a block and its timestamp (seconds since epoch).
    pub fn insert_block(&self, block_number: u64, timestamp: i64) {
        let mut state = self.lock();
        state.blocks.insert(block_number, timestamp);
        state.head = state.head.max(block_number);
    }

    /// Add an event to the history without delivering it live.
    pub fn record(&self, event: FeedEvent) {
        let mut state = self.lock();
        if let Some(block) = event.meta.block_number {
            state.head = state.head.max(block);
        }
        state.history.push(event);
    }

    /// Record an event and deliver it to the live subscriber of its kind.
    ///
    /// Returns `true` if a subscriber received it.
    pub async fn emit(&self, event: FeedEvent) -> bool {
        let sender = self.lock().subscribers.get(&event.kind()).cloned();
        self.record(event.clone());
        match sender {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Deliver an event live without recording it in the history.
    pub async fn push_live(&self, event: FeedEvent) -> bool {
        let sender = self.lock().subscribers.get(&event.kind()).cloned();
        match sender {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Simulate a lost node: every request after this fails.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Number of `block_timestamp` calls served so far.
    pub fn block_lookups(&self) -> u64 {
        self.block_lookups.load(Ordering::Relaxed)
    }

    fn ensure_online(&self) -> Result<(), IndexerError> {
        if self.lock().offline {
            return Err(IndexerError::Feed("feed offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Feed for MemoryFeed {
    async fn connect(&self) -> Result<(), IndexerError> {
        self.ensure_online()?;
        self.lock().connected = true;
        Ok(())
    }

    async fn subscribe(&self, kind: EventKind) -> Result<EventReceiver, IndexerError> {
        let mut state = self.lock();
        if !state.connected {
            return Err(IndexerError::Feed("not connected".into()));
        }
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        state.subscribers.insert(kind, tx);
        Ok(rx)
    }

    async fn unsubscribe_all(&self) -> Result<(), IndexerError> {
        self.lock().subscribers.clear();
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), IndexerError> {
        let mut state = self.lock();
        state.subscribers.clear();
        state.connected = false;
        Ok(())
    }

    async fn query_historical(
        &self,
        kind: EventKind,
        from: u64,
        to: u64,
    ) -> Result<Vec<FeedEvent>, IndexerError> {
        self.ensure_online()?;
        Ok(self
            .lock()
            .history
            .iter()
            .filter(|e| e.kind() == kind)
            .filter(|e| matches!(e.meta.block_number, Some(b) if b >= from && b <= to))
            .cloned()
            .collect())
    }

    async fn block_timestamp(&self, block_number: u64) -> Result<Option<i64>, IndexerError> {
        self.ensure_online()?;
        self.block_lookups.fetch_add(1, Ordering::Relaxed);
        Ok(self.lock().blocks.get(&block_number).copied())
    }

    async fn current_block_number(&self) -> Result<u64, IndexerError> {
        self.ensure_online()?;
        Ok(self.lock().head)
    }
}
