//! The `Store` trait (atomic multi-row writes) and an in-memory store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::IndexerError;
use crate::status::LifecycleStatus;
use crate::types::{EntityKind, Manufacturer, Product, ProductItem, ToxicItem, Transaction};

/// A single row-level write inside an atomic unit.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    InsertManufacturer(Manufacturer),
    InsertProduct(Product),
    InsertProductItem(ProductItem),
    /// Set status and timestamp on every item whose id is listed. Ids with
    /// no row are skipped.
    UpdateItemStatus {
        item_ids: Vec<String>,
        status: LifecycleStatus,
        timestamp: DateTime<Utc>,
    },
    AppendTransaction(Transaction),
    InsertToxicItem(ToxicItem),
}

/// Row counts reported by a committed unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub inserted: u64,
    pub updated: u64,
}

/// Persistent relational store.
///
/// Implementations include [`MemoryStore`] and the SQLite store in
/// `recycleindex-storage`.
#[async_trait]
pub trait Store: Send + Sync {
    /// Commit every op or none of them.
    ///
    /// Constraint failures map to `DuplicateEntity` / `DanglingReference`;
    /// anything else is `Store`.
    async fn apply_atomic(&self, ops: Vec<WriteOp>) -> Result<WriteSummary, IndexerError>;

    /// Point lookup for id-keyed entities (manufacturer, product, item).
    async fn exists(&self, kind: EntityKind, id: &str) -> Result<bool, IndexerError>;
}

// ─── In-memory store ──────────────────────────────────────────────────────────

/// Full contents of a [`MemoryStore`], comparable across runs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreSnapshot {
    pub manufacturers: BTreeMap<String, Manufacturer>,
    pub products: BTreeMap<String, Product>,
    pub product_items: BTreeMap<String, ProductItem>,
    pub transactions: Vec<Transaction>,
    pub toxic_items: Vec<ToxicItem>,
}

impl StoreSnapshot {
    fn apply(&mut self, op: WriteOp, summary: &mut WriteSummary) -> Result<(), IndexerError> {
        match op {
            WriteOp::InsertManufacturer(m) => {
                if self.manufacturers.contains_key(&m.id) {
                    return Err(IndexerError::DuplicateEntity {
                        entity: EntityKind::Manufacturer,
                        id: m.id,
                    });
                }
                self.manufacturers.insert(m.id.clone(), m);
                summary.inserted += 1;
            }
            WriteOp::InsertProduct(p) => {
                if self.products.contains_key(&p.id) {
                    return Err(IndexerError::DuplicateEntity {
                        entity: EntityKind::Product,
                        id: p.id,
                    });
                }
                if !self.manufacturers.contains_key(&p.manufacturer_id) {
                    return Err(IndexerError::DanglingReference {
                        entity: EntityKind::Product,
                        id: p.id,
                        target: EntityKind::Manufacturer,
                        target_id: p.manufacturer_id,
                    });
                }
                self.products.insert(p.id.clone(), p);
                summary.inserted += 1;
            }
            WriteOp::InsertProductItem(item) => {
                if self.product_items.contains_key(&item.id) {
                    return Err(IndexerError::DuplicateEntity {
                        entity: EntityKind::ProductItem,
                        id: item.id,
                    });
                }
                if !self.products.contains_key(&item.product_id) {
                    return Err(IndexerError::DanglingReference {
                        entity: EntityKind::ProductItem,
                        id: item.id,
                        target: EntityKind::Product,
                        target_id: item.product_id,
                    });
                }
                self.product_items.insert(item.id.clone(), item);
                summary.inserted += 1;
            }
            WriteOp::UpdateItemStatus {
                item_ids,
                status,
                timestamp,
            } => {
                for id in &item_ids {
                    if let Some(item) = self.product_items.get_mut(id) {
                        item.status = status;
                        item.timestamp = timestamp;
                        summary.updated += 1;
                    }
                }
            }
            WriteOp::AppendTransaction(tx) => {
                self.transactions.push(tx);
                summary.inserted += 1;
            }
            WriteOp::InsertToxicItem(toxic) => {
                if !self.products.contains_key(&toxic.product_id) {
                    return Err(IndexerError::DanglingReference {
                        entity: EntityKind::ToxicItem,
                        id: toxic.name,
                        target: EntityKind::Product,
                        target_id: toxic.product_id,
                    });
                }
                self.toxic_items.push(toxic);
                summary.inserted += 1;
            }
        }
        Ok(())
    }
}

/// In-memory store for tests and ephemeral indexers.
///
/// Each `apply_atomic` call stages its ops on a copy of the tables and swaps
/// the copy in only if every op succeeded.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<StoreSnapshot>,
    fail_at_op: Mutex<Option<usize>>,
    exists_checks: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> std::sync::MutexGuard<'_, StoreSnapshot> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next `apply_atomic` fail when it reaches op `index`.
    pub fn fail_next_apply_at(&self, index: usize) {
        *self.fail_at_op.lock().unwrap_or_else(|e| e.into_inner()) = Some(index);
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        self.tables().clone()
    }

    pub fn manufacturer(&self, id: &str) -> Option<Manufacturer> {
        self.tables().manufacturers.get(id).cloned()
    }

    pub fn product(&self, id: &str) -> Option<Product> {
        self.tables().products.get(id).cloned()
    }

    pub fn product_item(&self, id: &str) -> Option<ProductItem> {
        self.tables().product_items.get(id).cloned()
    }

    /// Status history of one item, oldest first.
    pub fn transactions_for(&self, item_id: &str) -> Vec<Transaction> {
        self.tables()
            .transactions
            .iter()
            .filter(|t| t.product_item_id == item_id)
            .cloned()
            .collect()
    }

    pub fn toxic_items(&self) -> Vec<ToxicItem> {
        self.tables().toxic_items.clone()
    }

    /// Number of `exists` calls served so far.
    pub fn exists_checks(&self) -> u64 {
        self.exists_checks.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn apply_atomic(&self, ops: Vec<WriteOp>) -> Result<WriteSummary, IndexerError> {
        let fail_at = self
            .fail_at_op
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        let mut tables = self.tables();
        let mut staged = tables.clone();
        let mut summary = WriteSummary::default();
        for (index, op) in ops.into_iter().enumerate() {
            if fail_at == Some(index) {
                return Err(IndexerError::Store(format!("injected failure at op {index}")));
            }
            staged.apply(op, &mut summary)?;
        }
        *tables = staged;
        Ok(summary)
    }

    async fn exists(&self, kind: EntityKind, id: &str) -> Result<bool, IndexerError> {
        self.exists_checks.fetch_add(1, Ordering::Relaxed);
        let tables = self.tables();
        match kind {
            EntityKind::Manufacturer => Ok(tables.manufacturers.contains_key(id)),
            EntityKind::Product => Ok(tables.products.contains_key(id)),
            EntityKind::ProductItem => Ok(tables.product_items.contains_key(id)),
            EntityKind::Transaction | EntityKind::ToxicItem => Err(IndexerError::Store(format!(
                "{kind} rows are not addressable by id"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn manufacturer(id: &str) -> WriteOp {
        WriteOp::InsertManufacturer(Manufacturer {
            id: id.into(),
            name: "Acme".into(),
            location: "NY".into(),
            contact: "c@acme.com".into(),
            timestamp: ts(),
        })
    }

    fn product(id: &str, manufacturer_id: &str) -> WriteOp {
        WriteOp::InsertProduct(Product {
            id: id.into(),
            name: "Widget".into(),
            manufacturer_id: manufacturer_id.into(),
            timestamp: ts(),
        })
    }

    #[tokio::test]
    async fn unit_commits_all_ops() {
        let store = MemoryStore::new();
        let summary = store
            .apply_atomic(vec![manufacturer("m1"), product("7", "m1")])
            .await
            .unwrap();
        assert_eq!(summary.inserted, 2);
        assert!(store.exists(EntityKind::Product, "7").await.unwrap());
    }

    #[tokio::test]
    async fn failing_op_rolls_back_whole_unit() {
        let store = MemoryStore::new();
        let err = store
            .apply_atomic(vec![manufacturer("m1"), product("7", "missing")])
            .await
            .unwrap_err();
        assert!(matches!(err, IndexerError::DanglingReference { .. }));
        assert!(store.manufacturer("m1").is_none());
    }

    #[tokio::test]
    async fn duplicate_insert_is_reported() {
        let store = MemoryStore::new();
        store.apply_atomic(vec![manufacturer("m1")]).await.unwrap();
        let err = store.apply_atomic(vec![manufacturer("m1")]).await.unwrap_err();
        assert!(matches!(
            err,
            IndexerError::DuplicateEntity { entity: EntityKind::Manufacturer, ref id } if id == "m1"
        ));
    }

    #[tokio::test]
    async fn injected_failure_fires_once() {
        let store = MemoryStore::new();
        store.fail_next_apply_at(1);
        assert!(store
            .apply_atomic(vec![manufacturer("m1"), manufacturer("m2")])
            .await
            .is_err());
        assert!(store.snapshot().manufacturers.is_empty());

        store
            .apply_atomic(vec![manufacturer("m1"), manufacturer("m2")])
            .await
            .unwrap();
        assert_eq!(store.snapshot().manufacturers.len(), 2);
    }

    #[tokio::test]
    async fn unkeyed_entities_reject_exists() {
        let store = MemoryStore::new();
        assert!(store.exists(EntityKind::ToxicItem, "x").await.is_err());
    }
}
