//! Domain rows shared by the applier and the store backends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::LifecycleStatus;

// ─── EntityKind ───────────────────────────────────────────────────────────────

/// The tables a store must provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Manufacturer,
    Product,
    ProductItem,
    Transaction,
    ToxicItem,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Manufacturer => write!(f, "manufacturer"),
            Self::Product => write!(f, "product"),
            Self::ProductItem => write!(f, "product item"),
            Self::Transaction => write!(f, "transaction"),
            Self::ToxicItem => write!(f, "toxic item"),
        }
    }
}

// ─── Rows ─────────────────────────────────────────────────────────────────────

/// A registered manufacturer. Immutable once inserted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manufacturer {
    /// On-chain manufacturer id (the registering account).
    pub id: String,
    pub name: String,
    pub location: String,
    pub contact: String,
    pub timestamp: DateTime<Utc>,
}

/// A product line owned by a manufacturer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    /// Decimal rendering of the on-chain numeric id.
    pub id: String,
    pub name: String,
    pub manufacturer_id: String,
    pub timestamp: DateTime<Utc>,
}

/// A single physical item of a product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductItem {
    pub id: String,
    pub product_id: String,
    pub status: LifecycleStatus,
    /// Time of the last status change.
    pub timestamp: DateTime<Utc>,
}

/// Append-only status history row for a product item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub product_item_id: String,
    pub status: LifecycleStatus,
    pub timestamp: DateTime<Utc>,
}

/// Toxic material declared against a product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToxicItem {
    pub product_id: String,
    pub name: String,
    pub weight: f64,
    pub timestamp: DateTime<Utc>,
}

// ─── IndexPhase ───────────────────────────────────────────────────────────────

/// Which driver delivered an event into the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexPhase {
    /// Replayed from a historical range query.
    Backfill,
    /// Pushed by the live subscription.
    Live,
}

impl std::fmt::Display for IndexPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Backfill => write!(f, "backfill"),
            Self::Live => write!(f, "live"),
        }
    }
}
